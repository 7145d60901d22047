//! Authentication negotiation during startup.
//!
//! The server drives the exchange: each `Authentication*` message is handed
//! to [`Authenticator::handle`], which answers with the next frontend message
//! or reports that authentication finished.

use bytes::Bytes;
use tracing::debug;

use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::protocol::{BackendMessage, FrontendMessage};
use crate::scram::{ScramClient, SCRAM_SHA_256};

/// Where the exchange stands.
enum State {
    Initial,
    /// SASLInitialResponse sent, waiting for server-first.
    SaslStarted(ScramClient),
    /// Client-final sent, waiting for the server signature.
    SaslProofSent(ScramClient),
    /// Server signature verified, waiting for AuthenticationOk.
    SaslVerified,
    Done,
}

/// What the connection should do after an authentication message.
#[derive(Debug, PartialEq)]
pub(crate) enum AuthStep {
    /// Send this and wait for the next message.
    Respond(FrontendMessage),
    /// Nothing to send; keep reading.
    Continue,
    /// AuthenticationOk received.
    Done,
}

pub(crate) struct Authenticator {
    user: String,
    password: Option<String>,
    state: State,
}

impl Authenticator {
    pub(crate) fn new(config: &PgConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.resolve_password(),
            state: State::Initial,
        }
    }

    fn password(&self) -> PgResult<&str> {
        self.password.as_deref().ok_or_else(|| {
            PgError::Auth("The server requested a password but none was supplied".to_string())
        })
    }

    /// Advance the exchange with one `Authentication*` message.
    pub(crate) fn handle(&mut self, msg: BackendMessage) -> PgResult<AuthStep> {
        let state = std::mem::replace(&mut self.state, State::Done);

        match (state, msg) {
            (State::Initial | State::SaslVerified, BackendMessage::AuthenticationOk) => {
                Ok(AuthStep::Done)
            }
            (State::Initial, BackendMessage::AuthenticationCleartextPassword) => {
                debug!(user = %self.user, "authenticating with cleartext password");
                self.state = State::Initial;
                Ok(AuthStep::Respond(FrontendMessage::Password {
                    password: self.password()?.to_string(),
                }))
            }
            (State::Initial, BackendMessage::AuthenticationMD5Password { salt }) => {
                debug!(user = %self.user, "authenticating with md5");
                self.state = State::Initial;
                Ok(AuthStep::Respond(FrontendMessage::Password {
                    password: md5_password(&self.user, self.password()?, &salt),
                }))
            }
            (State::Initial, BackendMessage::AuthenticationSASL { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::Auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                debug!(user = %self.user, "authenticating with SCRAM-SHA-256");
                let scram = ScramClient::new(self.password()?);
                let data = Bytes::from(scram.client_first_message());
                self.state = State::SaslStarted(scram);
                Ok(AuthStep::Respond(FrontendMessage::SaslInitialResponse {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data,
                }))
            }
            (State::SaslStarted(mut scram), BackendMessage::AuthenticationSASLContinue { data }) => {
                let client_final = scram.process_server_first(&data)?;
                self.state = State::SaslProofSent(scram);
                Ok(AuthStep::Respond(FrontendMessage::SaslResponse {
                    data: Bytes::from(client_final),
                }))
            }
            (State::SaslProofSent(scram), BackendMessage::AuthenticationSASLFinal { data }) => {
                scram.verify_server_final(&data)?;
                self.state = State::SaslVerified;
                Ok(AuthStep::Continue)
            }
            (_, BackendMessage::AuthenticationUnsupported { code, .. }) => Err(PgError::Auth(
                format!("Unsupported authentication method (code {})", code),
            )),
            (_, other) => Err(PgError::Auth(format!(
                "Unexpected {} during authentication",
                other.name()
            ))),
        }
    }
}

/// Compute MD5 password hash.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Convert inner hash to hex string, then append salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.as_bytes().to_vec();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}
