//! Wire-level tests against a scripted in-memory server.
//!
//! The mock server speaks the backend side of the protocol over
//! `tokio::io::duplex`, using the crate's own frame decoder and codec. It
//! answers a small fixed set of queries (see [`mock::reply`]).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;

use crate::client::{Client, ClientEvent};
use crate::config::{PgConfig, SslMode};
use crate::connection::Connection;
use crate::error::PgError;
use crate::pool::{PgPool, PoolConfig, PoolStatus};
use crate::protocol::{BackendMessage, FrontendMessage, TransactionStatus};
use crate::query::Query;
use crate::types::{Format, Oid, PgValue, TypeRegistry};

use self::mock::{Auth, MockConnector};

/// Poll `cond` until it holds.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

fn config() -> PgConfig {
    PgConfig::new("mock", 5432, "alice", "app")
}

async fn connect(mock: &Arc<MockConnector>, config: PgConfig) -> Client {
    Client::connect_with(Arc::new(config), mock.clone())
        .await
        .unwrap()
}

// ============================================================================
// Mock server
// ============================================================================

mod mock {
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use crate::auth::md5_password;
    use crate::config::PgConfig;
    use crate::frame::{Frame, FrameDecoder};
    use crate::protocol::{BackendMessage, FieldDescription, FrontendMessage, Target, TransactionStatus};
    use crate::scram::server::ScramServer;
    use crate::scram::SCRAM_SHA_256;
    use crate::transport::{BoxTransport, Connector};
    use crate::types::{Format, Oid};

    pub const PROCESS_ID: i32 = 42;
    pub const SECRET_KEY: i32 = 7;
    /// How long `SELECT pg_sleep(..)` takes to answer.
    pub const SLEEP: std::time::Duration = std::time::Duration::from_millis(100);

    #[derive(Debug, Clone, Copy)]
    pub enum Auth {
        Trust,
        Cleartext(&'static str),
        Md5(&'static str),
        Scram(&'static str),
    }

    /// What the server saw, across all connections.
    #[derive(Debug, Default)]
    pub struct ServerLog {
        pub startups: usize,
        pub parses: Vec<String>,
        pub closed_statements: Vec<String>,
        pub cancels: Vec<(i32, i32)>,
        pub terminated: usize,
        pub ssl_requests: usize,
    }

    pub struct MockConnector {
        pub auth: Auth,
        /// Write every response one byte at a time
        pub trickle: bool,
        pub log: Arc<Mutex<ServerLog>>,
        pub connects: AtomicUsize,
        servers: Mutex<Vec<JoinHandle<()>>>,
    }

    impl MockConnector {
        pub fn new(auth: Auth) -> Arc<Self> {
            Arc::new(Self {
                auth,
                trickle: false,
                log: Arc::default(),
                connects: AtomicUsize::new(0),
                servers: Mutex::default(),
            })
        }

        pub fn trickling(auth: Auth) -> Arc<Self> {
            Arc::new(Self {
                auth,
                trickle: true,
                log: Arc::default(),
                connects: AtomicUsize::new(0),
                servers: Mutex::default(),
            })
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// Stop every server task, dropping its end of the socket.
        pub fn kill_all(&self) {
            for server in self.servers.lock().drain(..) {
                server.abort();
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _config: &PgConfig) -> io::Result<BoxTransport> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let index = self.connects.fetch_add(1, Ordering::SeqCst) as i32;
            let server = MockServer {
                stream: server,
                decoder: FrameDecoder::default(),
                out: BytesMut::new(),
                trickle: self.trickle,
                index,
            };
            let task = tokio::spawn(run(server, self.auth, Arc::clone(&self.log)));
            self.servers.lock().push(task);
            Ok(Box::new(client))
        }
    }

    fn field(name: &str, oid: Oid) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: -1,
            type_modifier: -1,
            format: Format::Text,
        }
    }

    pub fn error(code: &str, message: &str) -> BackendMessage {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'V', "ERROR".to_string());
        fields.insert(b'C', code.to_string());
        fields.insert(b'M', message.to_string());
        BackendMessage::ErrorResponse { fields }
    }

    fn notice(message: &str) -> BackendMessage {
        let mut fields = HashMap::new();
        fields.insert(b'S', "NOTICE".to_string());
        fields.insert(b'C', "00000".to_string());
        fields.insert(b'M', message.to_string());
        BackendMessage::NoticeResponse { fields }
    }

    /// The server's answer to one statement.
    pub enum Reply {
        Rows(Vec<FieldDescription>, Vec<Vec<Option<String>>>),
        Command(String),
        Error(&'static str, String),
        CopyOut(Vec<&'static str>),
        Listen(String),
        Set(String, String),
    }

    pub fn reply(sql: &str) -> Reply {
        match sql {
            "SELECT a, b, c" => Reply::Rows(
                vec![
                    field("a", Oid::INT4),
                    field("b", Oid::TEXT),
                    field("c", Oid::BOOL),
                ],
                (1..=3)
                    .map(|i| {
                        vec![
                            Some(i.to_string()),
                            Some(format!("row{}", i)),
                            Some(if i % 2 == 1 { "t" } else { "f" }.to_string()),
                        ]
                    })
                    .collect(),
            ),
            "SELECT n FROM series" => Reply::Rows(
                vec![field("n", Oid::INT4)],
                (1..=10).map(|i| vec![Some(i.to_string())]).collect(),
            ),
            "SELECT 1" => Reply::Rows(
                vec![field("?column?", Oid::INT4)],
                vec![vec![Some("1".to_string())]],
            ),
            "SELECT NULL AS x, 2 AS x" => Reply::Rows(
                vec![field("x", Oid::TEXT), field("x", Oid::INT4)],
                vec![vec![None, Some("2".to_string())]],
            ),
            "SELECT bogus" => Reply::Error("42703", "column \"bogus\" does not exist".into()),
            "BEGIN" | "COMMIT" | "ROLLBACK" => Reply::Command(sql.to_string()),
            s if s.starts_with("SELECT pg_sleep") => Reply::Command("SELECT 1".to_string()),
            s if s.starts_with("UPDATE") => Reply::Command("UPDATE 4".to_string()),
            s if s.starts_with("INSERT") => Reply::Command("INSERT 0 1".to_string()),
            s if s.starts_with("COPY") && s.ends_with("TO STDOUT") => {
                Reply::CopyOut(vec!["1\tone\n", "2\ttwo\n"])
            }
            s if s.starts_with("LISTEN ") => Reply::Listen(s["LISTEN ".len()..].to_string()),
            s if s.starts_with("SET ") => {
                let (name, value) = s["SET ".len()..].split_once(" = ").unwrap_or(("x", "y"));
                Reply::Set(name.to_string(), value.to_string())
            }
            _ => Reply::Error("42601", format!("syntax error at or near \"{}\"", sql)),
        }
    }

    struct MockServer {
        stream: DuplexStream,
        decoder: FrameDecoder,
        out: BytesMut,
        trickle: bool,
        index: i32,
    }

    impl MockServer {
        async fn read_untagged(&mut self) -> Option<FrontendMessage> {
            let mut len = [0u8; 4];
            self.stream.read_exact(&mut len).await.ok()?;
            let len = i32::from_be_bytes(len) as usize;
            let mut payload = vec![0u8; len.checked_sub(4)?];
            self.stream.read_exact(&mut payload).await.ok()?;
            FrontendMessage::decode_untagged(Bytes::from(payload)).ok()
        }

        async fn read_frame(&mut self) -> Option<Frame> {
            loop {
                if let Some(frame) = self.decoder.next_frame().ok()? {
                    return Some(frame);
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                // Frames are pulled by next_frame above
                let _ = self.decoder.feed(&chunk[..n]);
            }
        }

        async fn recv(&mut self) -> Option<FrontendMessage> {
            let frame = self.read_frame().await?;
            FrontendMessage::decode(frame.tag, frame.payload).ok()
        }

        fn push(&mut self, msg: BackendMessage) {
            msg.encode_to(&mut self.out);
        }

        async fn flush(&mut self) -> Option<()> {
            let out = self.out.split().freeze();
            if self.trickle {
                for byte in out.iter() {
                    self.stream.write_all(&[*byte]).await.ok()?;
                    self.stream.flush().await.ok()?;
                    tokio::task::yield_now().await;
                }
            } else {
                self.stream.write_all(&out).await.ok()?;
                self.stream.flush().await.ok()?;
            }
            Some(())
        }

        async fn fail_auth(&mut self) -> Option<bool> {
            self.push(error("28P01", "password authentication failed for user"));
            self.flush().await?;
            Some(false)
        }

        /// Run startup; false when the connection should end.
        async fn handshake(&mut self, auth: Auth, log: &Mutex<ServerLog>) -> Option<bool> {
            let mut msg = self.read_untagged().await?;
            if msg == FrontendMessage::SslRequest {
                log.lock().ssl_requests += 1;
                self.stream.write_all(b"N").await.ok()?;
                msg = self.read_untagged().await?;
            }

            let user = match msg {
                FrontendMessage::CancelRequest {
                    process_id,
                    secret_key,
                } => {
                    log.lock().cancels.push((process_id, secret_key));
                    return Some(false);
                }
                FrontendMessage::Startup { user, .. } => user,
                _ => return Some(false),
            };
            log.lock().startups += 1;

            match auth {
                Auth::Trust => {}
                Auth::Cleartext(expected) => {
                    self.push(BackendMessage::AuthenticationCleartextPassword);
                    self.flush().await?;
                    match self.recv().await? {
                        FrontendMessage::Password { password } if password == expected => {}
                        _ => return self.fail_auth().await,
                    }
                }
                Auth::Md5(expected) => {
                    let salt = [1, 2, 3, 4];
                    self.push(BackendMessage::AuthenticationMD5Password { salt });
                    self.flush().await?;
                    let hashed = md5_password(&user, expected, &salt);
                    match self.recv().await? {
                        FrontendMessage::Password { password } if password == hashed => {}
                        _ => return self.fail_auth().await,
                    }
                }
                Auth::Scram(expected) => {
                    let mut scram = ScramServer::new(expected);
                    self.push(BackendMessage::AuthenticationSASL {
                        mechanisms: vec![SCRAM_SHA_256.to_string()],
                    });
                    self.flush().await?;

                    let frame = self.read_frame().await?;
                    let first = match FrontendMessage::decode_sasl(true, frame.payload).ok()? {
                        FrontendMessage::SaslInitialResponse { data, .. } => data,
                        _ => return Some(false),
                    };
                    self.push(BackendMessage::AuthenticationSASLContinue {
                        data: Bytes::from(scram.server_first(&first)),
                    });
                    self.flush().await?;

                    let frame = self.read_frame().await?;
                    let last = match FrontendMessage::decode_sasl(false, frame.payload).ok()? {
                        FrontendMessage::SaslResponse { data } => data,
                        _ => return Some(false),
                    };
                    let verdict = scram.server_final(&last);
                    if verdict.starts_with(b"e=") {
                        return self.fail_auth().await;
                    }
                    self.push(BackendMessage::AuthenticationSASLFinal {
                        data: Bytes::from(verdict),
                    });
                }
            }

            self.push(BackendMessage::AuthenticationOk);
            for (name, value) in [("server_version", "16.0"), ("client_encoding", "UTF8")] {
                self.push(BackendMessage::ParameterStatus {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            self.push(BackendMessage::BackendKeyData {
                process_id: PROCESS_ID + self.index,
                secret_key: SECRET_KEY,
            });
            self.push(BackendMessage::ReadyForQuery {
                status: TransactionStatus::Idle,
            });
            self.flush().await?;
            Some(true)
        }

        fn push_rows(&mut self, rows: &[Vec<Option<String>>]) {
            for row in rows {
                self.push(BackendMessage::DataRow {
                    values: row
                        .iter()
                        .map(|v| v.as_ref().map(|s| Bytes::from(s.clone())))
                        .collect(),
                });
            }
        }
    }

    struct Portal {
        query: String,
        sent: usize,
    }

    #[derive(Default)]
    struct Session {
        statements: HashMap<String, String>,
        portals: HashMap<String, Portal>,
        /// After an extended-protocol error, until Sync
        skipping: bool,
        copy_in: Option<u64>,
        status: Option<TransactionStatus>,
    }

    impl Session {
        fn status(&self) -> TransactionStatus {
            self.status.unwrap_or(TransactionStatus::Idle)
        }
    }

    async fn run(mut server: MockServer, auth: Auth, log: Arc<Mutex<ServerLog>>) {
        if server.handshake(auth, &log).await != Some(true) {
            return;
        }
        let mut session = Session::default();
        while let Some(msg) = server.recv().await {
            if handle(&mut server, &mut session, &log, msg).await.is_none() {
                return;
            }
        }
    }

    /// One frontend message; `None` ends the connection.
    async fn handle(
        server: &mut MockServer,
        session: &mut Session,
        log: &Mutex<ServerLog>,
        msg: FrontendMessage,
    ) -> Option<()> {
        match msg {
            FrontendMessage::Query { query } => {
                if query == "SELECT crash" {
                    return None;
                }
                if query.starts_with("COPY") && query.ends_with("FROM STDIN") {
                    server.push(BackendMessage::CopyInResponse {
                        format: Format::Text,
                        column_formats: vec![Format::Text],
                    });
                    session.copy_in = Some(0);
                    return server.flush().await;
                }
                if query.starts_with("SELECT pg_sleep") {
                    tokio::time::sleep(SLEEP).await;
                }
                simple_query(server, session, &query);
                server.push(BackendMessage::ReadyForQuery {
                    status: session.status(),
                });
                server.flush().await?;
            }
            FrontendMessage::CopyData { .. } => {
                if let Some(n) = session.copy_in.as_mut() {
                    *n += 1;
                }
            }
            FrontendMessage::CopyDone => {
                let n = session.copy_in.take().unwrap_or(0);
                server.push(BackendMessage::CommandComplete {
                    tag: format!("COPY {}", n),
                });
                server.push(BackendMessage::ReadyForQuery {
                    status: session.status(),
                });
                server.flush().await?;
            }
            FrontendMessage::CopyFail { message } => {
                session.copy_in = None;
                server.push(error("57014", &format!("COPY from stdin failed: {}", message)));
                server.push(BackendMessage::ReadyForQuery {
                    status: session.status(),
                });
                server.flush().await?;
            }
            _ if session.skipping && !matches!(msg, FrontendMessage::Sync | FrontendMessage::Terminate) => {}
            FrontendMessage::Parse { name, query, .. } => {
                log.lock().parses.push(query.clone());
                if let Reply::Error(code, message) = reply(&query) {
                    server.push(error(code, &message));
                    session.skipping = true;
                    server.flush().await?;
                } else {
                    session.statements.insert(name, query);
                    server.push(BackendMessage::ParseComplete);
                }
            }
            FrontendMessage::Bind {
                portal, statement, ..
            } => match session.statements.get(&statement) {
                Some(query) => {
                    session.portals.insert(
                        portal,
                        Portal {
                            query: query.clone(),
                            sent: 0,
                        },
                    );
                    server.push(BackendMessage::BindComplete);
                }
                None => {
                    server.push(error(
                        "26000",
                        &format!("prepared statement \"{}\" does not exist", statement),
                    ));
                    session.skipping = true;
                    server.flush().await?;
                }
            },
            FrontendMessage::Describe {
                target: Target::Portal,
                name,
            } => {
                let query = session.portals.get(&name).map(|p| p.query.clone())?;
                match reply(&query) {
                    Reply::Rows(fields, _) => server.push(BackendMessage::RowDescription { fields }),
                    _ => server.push(BackendMessage::NoData),
                }
            }
            FrontendMessage::Execute { portal, max_rows } => {
                let p = session.portals.get_mut(&portal)?;
                if p.query.starts_with("SELECT pg_sleep") {
                    tokio::time::sleep(SLEEP).await;
                }
                match reply(&p.query) {
                    Reply::Rows(_, rows) => {
                        let remaining = &rows[p.sent..];
                        let limit = usize::try_from(max_rows).unwrap_or(0);
                        if limit > 0 && remaining.len() > limit {
                            let batch = remaining[..limit].to_vec();
                            p.sent += limit;
                            server.push_rows(&batch);
                            server.push(BackendMessage::PortalSuspended);
                        } else {
                            let batch = remaining.to_vec();
                            p.sent = rows.len();
                            server.push_rows(&batch);
                            server.push(BackendMessage::CommandComplete {
                                tag: format!("SELECT {}", batch.len()),
                            });
                        }
                    }
                    Reply::Command(tag) => server.push(BackendMessage::CommandComplete { tag }),
                    _ => server.push(BackendMessage::CommandComplete {
                        tag: "SELECT 0".to_string(),
                    }),
                }
            }
            FrontendMessage::Close { target, name } => {
                match target {
                    Target::Statement => {
                        log.lock().closed_statements.push(name.clone());
                        session.statements.remove(&name);
                    }
                    Target::Portal => {
                        session.portals.remove(&name);
                    }
                }
                server.push(BackendMessage::CloseComplete);
            }
            FrontendMessage::Sync => {
                session.skipping = false;
                session.portals.remove("");
                server.push(BackendMessage::ReadyForQuery {
                    status: session.status(),
                });
                server.flush().await?;
            }
            FrontendMessage::Flush => server.flush().await?,
            FrontendMessage::Terminate => {
                log.lock().terminated += 1;
                return None;
            }
            _ => {}
        }
        Some(())
    }

    fn simple_query(server: &mut MockServer, session: &mut Session, query: &str) {
        let statements: Vec<&str> = query
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if statements.is_empty() {
            server.push(BackendMessage::EmptyQueryResponse);
            return;
        }

        for sql in statements {
            match reply(sql) {
                Reply::Rows(fields, rows) => {
                    let n = rows.len();
                    server.push(BackendMessage::RowDescription { fields });
                    server.push_rows(&rows);
                    server.push(BackendMessage::CommandComplete {
                        tag: format!("SELECT {}", n),
                    });
                }
                Reply::Command(tag) => {
                    session.status = match tag.as_str() {
                        "BEGIN" => Some(TransactionStatus::InTransaction),
                        "COMMIT" | "ROLLBACK" => None,
                        _ => session.status,
                    };
                    server.push(BackendMessage::CommandComplete { tag });
                }
                Reply::Error(code, message) => {
                    if session.status.is_some() {
                        session.status = Some(TransactionStatus::Failed);
                    }
                    server.push(error(code, &message));
                    return;
                }
                Reply::CopyOut(chunks) => {
                    server.push(BackendMessage::CopyOutResponse {
                        format: Format::Text,
                        column_formats: vec![Format::Text, Format::Text],
                    });
                    for chunk in &chunks {
                        server.push(BackendMessage::CopyData {
                            data: Bytes::from_static(chunk.as_bytes()),
                        });
                    }
                    server.push(BackendMessage::CopyDone);
                    server.push(BackendMessage::CommandComplete {
                        tag: format!("COPY {}", chunks.len()),
                    });
                }
                Reply::Listen(channel) => {
                    server.push(notice("listening"));
                    server.push(BackendMessage::NotificationResponse {
                        process_id: PROCESS_ID,
                        channel,
                        payload: "hello".to_string(),
                    });
                    server.push(BackendMessage::CommandComplete {
                        tag: "LISTEN".to_string(),
                    });
                }
                Reply::Set(name, value) => {
                    server.push(BackendMessage::ParameterStatus { name, value });
                    server.push(BackendMessage::CommandComplete {
                        tag: "SET".to_string(),
                    });
                }
            }
        }
    }
}

// ============================================================================
// Startup and authentication
// ============================================================================

mod startup {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_trust_startup_exposes_server_state() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        assert_eq!(client.parameter("server_version").as_deref(), Some("16.0"));
        assert_eq!(client.process_id(), Some(mock::PROCESS_ID));
        assert_eq!(client.transaction_status(), TransactionStatus::Idle);
        assert!(!client.is_closed());
        assert_eq!(mock.log.lock().startups, 1);
    }

    #[tokio::test]
    async fn test_cleartext_password() {
        let mock = MockConnector::new(Auth::Cleartext("secret"));
        let client = connect(&mock, config().password("secret")).await;
        assert_eq!(client.simple_query("SELECT 1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_md5_password() {
        let mock = MockConnector::new(Auth::Md5("hunter2"));
        let client = connect(&mock, config().password("hunter2")).await;
        assert_eq!(client.process_id(), Some(mock::PROCESS_ID));
    }

    #[tokio::test]
    async fn test_md5_wrong_password_is_auth_error() {
        let mock = MockConnector::new(Auth::Md5("hunter2"));
        let err = Client::connect_with(Arc::new(config().password("nope")), mock.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Auth(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_md5_without_password_fails_locally() {
        let mock = MockConnector::new(Auth::Md5("hunter2"));
        let err = Client::connect_with(Arc::new(config()), mock.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Auth(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_scram_sha_256() {
        let mock = MockConnector::new(Auth::Scram("pencil"));
        let client = connect(&mock, config().password("pencil")).await;
        let results = client.simple_query("SELECT 1").await.unwrap();
        assert_eq!(results[0].rows[0][0], PgValue::Int4(1));
    }

    #[tokio::test]
    async fn test_scram_wrong_password() {
        let mock = MockConnector::new(Auth::Scram("pencil"));
        let err = Client::connect_with(Arc::new(config().password("crayon")), mock.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Auth(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_password_lookup_hook() {
        let mock = MockConnector::new(Auth::Cleartext("from-file"));
        let lookup = crate::config::PasswordLookup::new(|_| Some("from-file".to_string()));
        let client = connect(&mock, config().password_lookup(lookup)).await;
        assert!(client.simple_query("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn test_ssl_required_but_refused() {
        let mock = MockConnector::new(Auth::Trust);
        let err = Client::connect_with(Arc::new(config().ssl(SslMode::Require)), mock.clone())
            .await
            .unwrap_err();
        match err {
            PgError::Connection(msg) => {
                assert_eq!(msg, "The server does not support SSL connections")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mock.log.lock().startups, 0);
    }

    #[tokio::test]
    async fn test_ssl_preferred_falls_back_to_plaintext() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config().ssl(SslMode::Prefer)).await;
        assert!(client.simple_query("SELECT 1").await.is_ok());
        assert_eq!(mock.log.lock().ssl_requests, 1);
    }

    /// Accepts transports and never answers.
    struct SilentConnector(parking_lot::Mutex<Vec<tokio::io::DuplexStream>>);

    #[async_trait::async_trait]
    impl crate::transport::Connector for SilentConnector {
        async fn connect(
            &self,
            _config: &PgConfig,
        ) -> std::io::Result<crate::transport::BoxTransport> {
            let (client, server) = tokio::io::duplex(1024);
            self.0.lock().push(server);
            Ok(Box::new(client))
        }
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let connector = Arc::new(SilentConnector(Default::default()));
        let config = config().connect_timeout(Duration::from_millis(30));
        let err = Client::connect_with(Arc::new(config), connector)
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Timeout(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_raw_connection_message_stream() {
        let mock = MockConnector::new(Auth::Trust);
        let mut conn = Connection::connect(Arc::new(config()), mock.clone())
            .await
            .unwrap();
        assert_eq!(conn.parameter("client_encoding"), Some("UTF8"));

        conn.send(&FrontendMessage::Query {
            query: "SELECT 1".to_string(),
        })
        .await
        .unwrap();

        let mut names = Vec::new();
        loop {
            let msg = conn.recv().await.unwrap();
            names.push(msg.name());
            if matches!(msg, BackendMessage::ReadyForQuery { .. }) {
                break;
            }
        }
        assert_eq!(
            names,
            vec!["RowDescription", "DataRow", "CommandComplete", "ReadyForQuery"]
        );
        conn.close().await.unwrap();
        wait_for(|| mock.log.lock().terminated == 1).await;
    }
}

// ============================================================================
// Queries
// ============================================================================

mod queries {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_simple_query_three_rows() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let results = client.simple_query("SELECT a, b, c").await.unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.command.as_deref(), Some("SELECT"));
        assert_eq!(result.row_count, Some(3));
        assert_eq!(result.columns[1].name, "b");
        assert_eq!(result.rows[0][0], PgValue::Int4(1));
        assert_eq!(result.rows[1][1], PgValue::Text("row2".into()));
        assert_eq!(result.rows[1][2], PgValue::Bool(false));
    }

    #[tokio::test]
    async fn test_responses_trickled_one_byte_at_a_time() {
        let mock = MockConnector::trickling(Auth::Md5("hunter2"));
        let client = connect(&mock, config().password("hunter2")).await;

        let results = client.simple_query("SELECT a, b, c").await.unwrap();
        assert_eq!(results[0].rows.len(), 3);
        assert_eq!(results[0].rows[2][0], PgValue::Int4(3));
    }

    #[tokio::test]
    async fn test_multi_statement_results() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let results = client
            .simple_query("SELECT 1; UPDATE t SET x = 1")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rows.len(), 1);
        assert!(results[1].rows.is_empty());
        assert_eq!(results[1].command.as_deref(), Some("UPDATE"));
        assert_eq!(results[1].rows_affected(), 4);
    }

    #[tokio::test]
    async fn test_empty_query() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let results = client.simple_query("  ").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].command, None);
        assert_eq!(results[0].command_tag, "");
    }

    #[tokio::test]
    async fn test_error_then_next_query_succeeds() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let err = client.query("SELECT bogus", &[]).await.unwrap_err();
        assert_eq!(err.code(), Some("42703"));
        assert!(!err.is_fatal());

        let result = client.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.rows[0][0], PgValue::Int4(1));

        let err = client.simple_query("SELECT bogus").await.unwrap_err();
        assert_eq!(
            err.as_db_error().map(|e| e.message.as_str()),
            Some("column \"bogus\" does not exist")
        );
        assert!(client.simple_query("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn test_prepared_statements_are_cached() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let first = client.query("SELECT a, b, c", &[]).await.unwrap();
        let second = client.query("SELECT a, b, c", &[]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.rows[2][1], PgValue::Text("row3".into()));
        assert_eq!(mock.log.lock().parses, vec!["SELECT a, b, c".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_parse_is_not_cached() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        assert!(client.query("SELECT bogus", &[]).await.is_err());
        assert!(client.query("SELECT bogus", &[]).await.is_err());
        assert_eq!(mock.log.lock().parses.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_eviction_closes_statement() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config().statement_cache_capacity(1)).await;

        client.query("SELECT 1", &[]).await.unwrap();
        client.query("SELECT a, b, c", &[]).await.unwrap();
        client.query("SELECT 1", &[]).await.unwrap();

        let log = mock.log.lock();
        assert_eq!(log.parses.len(), 3);
        assert_eq!(
            log.closed_statements,
            vec!["__pgkit_1".to_string(), "__pgkit_2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cache_disabled() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config().statement_cache_capacity(0)).await;

        client.query("SELECT 1", &[]).await.unwrap();
        client.query("SELECT 1", &[]).await.unwrap();

        let log = mock.log.lock();
        assert_eq!(log.parses.len(), 2);
        assert!(log.closed_statements.is_empty());
    }

    #[tokio::test]
    async fn test_named_statements() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        for _ in 0..2 {
            let result = client
                .query_with(Query::new("SELECT 1").name("one"))
                .await
                .unwrap();
            assert_eq!(result.rows.len(), 1);
        }
        assert_eq!(mock.log.lock().parses.len(), 1);

        let err = client
            .query_with(Query::new("SELECT a, b, c").name("one"))
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Usage(_)), "got {:?}", err);

        // The connection is still usable
        assert!(client.query("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_row_limit_stops_early() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let result = client
            .query_with(Query::new("SELECT n FROM series").max_rows(3))
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.command, None);
    }

    #[tokio::test]
    async fn test_duplicate_column_names() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let result = client.query("SELECT NULL AS x, 2 AS x", &[]).await.unwrap();
        let row = &result.rows[0];
        assert!(row[0].is_null());
        assert_eq!(row.get_by_name("x"), Some(&PgValue::Int4(2)));
    }

    #[tokio::test]
    async fn test_execute_returns_affected_rows() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let n = client
            .execute("UPDATE t SET x = $1", &[PgValue::Int4(5)])
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(client.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transaction_status_tracking() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        client.simple_query("BEGIN").await.unwrap();
        assert_eq!(client.transaction_status(), TransactionStatus::InTransaction);

        assert!(client.simple_query("SELECT bogus").await.is_err());
        assert_eq!(client.transaction_status(), TransactionStatus::Failed);

        client.simple_query("ROLLBACK").await.unwrap();
        assert_eq!(client.transaction_status(), TransactionStatus::Idle);
    }

    async fn run_concurrently(client: &Client) {
        let (a, b, c) = tokio::join!(
            client.query("SELECT a, b, c", &[]),
            client.query("SELECT bogus", &[]),
            client.query("UPDATE t SET x = 1", &[]),
        );
        assert_eq!(a.unwrap().rows.len(), 3);
        assert_eq!(b.unwrap_err().code(), Some("42703"));
        assert_eq!(c.unwrap().rows_affected(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_queries_resolve_in_order() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;
        run_concurrently(&client).await;
        assert!(client.query("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_pipelined_queries_resolve_in_order() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config().pipeline(true)).await;
        run_concurrently(&client).await;
        run_concurrently(&client).await;
    }

    #[tokio::test]
    async fn test_notices_and_notifications_are_events() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;
        let mut events = client.events();

        let results = client.simple_query("LISTEN jobs").await.unwrap();
        assert_eq!(results[0].command.as_deref(), Some("LISTEN"));
        assert!(results[0].rows.is_empty());

        match events.try_recv().unwrap() {
            ClientEvent::Notice(notice) => assert_eq!(notice.message, "listening"),
            other => panic!("unexpected {:?}", other),
        }
        match events.try_recv().unwrap() {
            ClientEvent::Notification {
                process_id,
                channel,
                payload,
            } => {
                assert_eq!(process_id, mock::PROCESS_ID);
                assert_eq!(channel, "jobs");
                assert_eq!(payload, "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parameter_status_updates() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;
        let mut events = client.events();

        client.simple_query("SET TimeZone = UTC").await.unwrap();
        assert_eq!(client.parameter("TimeZone").as_deref(), Some("UTC"));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::ParameterStatus { name, .. } if name == "TimeZone"
        ));
    }

    #[tokio::test]
    async fn test_copy_out() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let chunks = client.copy_out("COPY t TO STDOUT").await.unwrap();
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"1\tone\n"),
                Bytes::from_static(b"2\ttwo\n")
            ]
        );
    }

    #[tokio::test]
    async fn test_copy_in() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let data = vec![
            Bytes::from_static(b"1\tone\n"),
            Bytes::from_static(b"2\ttwo\n"),
            Bytes::from_static(b"3\tthree\n"),
        ];
        assert_eq!(client.copy_in("COPY t FROM STDIN", data).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_copy_in_through_plain_query_is_refused() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let err = client.simple_query("COPY t FROM STDIN").await.unwrap_err();
        assert_eq!(err.code(), Some("57014"));
        assert!(client.simple_query("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_request_and_closes() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;
        let mut events = client.events();

        let err = client.simple_query("SELECT crash").await.unwrap_err();
        assert!(err.is_fatal(), "got {:?}", err);
        assert!(client.is_closed());
        client.closed().await;

        assert!(matches!(events.recv().await.unwrap(), ClientEvent::Error(_)));
        assert!(matches!(
            client.simple_query("SELECT 1").await,
            Err(PgError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_sends_terminate() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        client.close().await.unwrap();
        assert!(client.is_closed());
        wait_for(|| mock.log.lock().terminated == 1).await;
        assert!(matches!(
            client.query("SELECT 1", &[]).await,
            Err(PgError::ConnectionClosed)
        ));
        // Closing twice is harmless
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_client_terminates() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;
        drop(client);
        wait_for(|| mock.log.lock().terminated == 1).await;
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        client.cancel().await.unwrap();
        wait_for(|| !mock.log.lock().cancels.is_empty()).await;
        assert_eq!(
            mock.log.lock().cancels,
            vec![(mock::PROCESS_ID, mock::SECRET_KEY)]
        );
        // The cancel used its own transport
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test]
    async fn test_query_timeout_fails_only_that_query() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let err = client
            .query_with(Query::new("SELECT pg_sleep(1)").timeout(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Timeout(_)), "got {:?}", err);
        assert!(!err.is_fatal());
        assert!(!client.is_closed());

        // The late response is discarded and the next query lines up behind it
        let result = client.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.rows[0][0], PgValue::Int4(1));
    }

    #[tokio::test]
    async fn test_connection_query_timeout_can_be_overridden() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config().query_timeout(Duration::from_millis(10))).await;

        let err = client.simple_query("SELECT pg_sleep(1)").await.unwrap_err();
        assert!(matches!(err, PgError::Timeout(_)), "got {:?}", err);

        let result = client
            .query_with(Query::new("SELECT pg_sleep(1)").timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.command_tag, "SELECT 1");
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_timed_out_queued_query_is_never_sent() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let mut slow = Box::pin(client.simple_query("SELECT pg_sleep(1)"));
        assert!(futures::poll!(slow.as_mut()).is_pending());

        let err = client
            .query_with(Query::new("SELECT a, b, c").timeout(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Timeout(_)), "got {:?}", err);

        assert_eq!(slow.await.unwrap().len(), 1);
        assert!(client.query("SELECT 1", &[]).await.is_ok());
        assert_eq!(mock.log.lock().parses, vec!["SELECT 1".to_string()]);
    }
}

// ============================================================================
// Cursors
// ============================================================================

mod cursors {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ints(rows: &[crate::result::Row]) -> Vec<i64> {
        rows.iter().filter_map(|r| r[0].as_i64()).collect()
    }

    #[tokio::test]
    async fn test_read_in_batches() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let mut cursor = client.cursor("SELECT n FROM series").await.unwrap();
        assert_eq!(cursor.columns()[0].name, "n");
        assert_eq!(cursor.columns()[0].type_oid, Oid::INT4);

        assert_eq!(ints(&cursor.read(4).await.unwrap()), vec![1, 2, 3, 4]);
        assert_eq!(ints(&cursor.read(4).await.unwrap()), vec![5, 6, 7, 8]);
        assert!(!cursor.is_finished());
        assert_eq!(ints(&cursor.read(4).await.unwrap()), vec![9, 10]);
        assert!(cursor.is_finished());
        assert!(cursor.read(4).await.unwrap().is_empty());
        cursor.close().await.unwrap();

        assert!(client.simple_query("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_cursor_open_does_not_hold_connection() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let mut opening = Box::pin(client.cursor("SELECT n FROM series"));
        assert!(futures::poll!(opening.as_mut()).is_pending());
        drop(opening);

        let result = client.query("SELECT a, b, c", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_queries_wait_for_open_cursor() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let mut cursor = client.cursor("SELECT n FROM series").await.unwrap();
        let (rows, result) = tokio::join!(
            async {
                let first = cursor.read(5).await.unwrap();
                let rest = cursor.read(5).await.unwrap();
                cursor.close().await.unwrap();
                ints(&first).into_iter().chain(ints(&rest)).collect::<Vec<_>>()
            },
            client.query("SELECT a, b, c", &[]),
        );
        assert_eq!(rows, (1..=10).collect::<Vec<i64>>());
        assert_eq!(result.unwrap().rows.len(), 3);
    }

    #[tokio::test]
    async fn test_dropping_open_cursor_releases_connection() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let mut cursor = client.cursor("SELECT n FROM series").await.unwrap();
        assert_eq!(cursor.read(2).await.unwrap().len(), 2);
        drop(cursor);

        let result = client.query("SELECT a, b, c", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_cursor_open_error() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let err = client.cursor("SELECT bogus").await.unwrap_err();
        assert_eq!(err.code(), Some("42703"));
        assert!(client.query("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_row_stream() {
        let mock = MockConnector::new(Auth::Trust);
        let client = connect(&mock, config()).await;

        let rows: Vec<_> = client
            .query_stream("SELECT n FROM series", 3)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ints(&rows), (1..=10).collect::<Vec<i64>>());
        assert!(client.simple_query("SELECT 1").await.is_ok());
    }
}

// ============================================================================
// Pool
// ============================================================================

mod pool {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool(mock: &Arc<MockConnector>, config: PoolConfig) -> PgPool {
        PgPool::with_connector(Arc::new(super::config()), config, mock.clone())
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new());

        let conn = pool.acquire().await.unwrap();
        conn.simple_query("SELECT 1").await.unwrap();
        drop(conn);
        assert_eq!(pool.status().idle, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.uses(), 1);
        assert_eq!(mock.connects(), 1);
        assert_eq!(
            pool.status(),
            PoolStatus {
                total: 1,
                idle: 0,
                busy: 1,
                waiting: 0
            }
        );
    }

    #[tokio::test]
    async fn test_waiters_served_in_order_without_new_connections() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new().max_connections(2));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..3 {
            let p = pool.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let conn = p.acquire().await.unwrap();
                order.lock().push(i);
                conn
            }));
            wait_for(|| pool.status().waiting == i + 1).await;
        }
        assert_eq!(
            pool.status(),
            PoolStatus {
                total: 2,
                idle: 0,
                busy: 2,
                waiting: 3
            }
        );

        drop(a);
        let first = waiters.remove(0).await.unwrap();
        assert_eq!(*order.lock(), vec![0]);

        drop(b);
        let second = waiters.remove(0).await.unwrap();
        drop(first);
        let third = waiters.remove(0).await.unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(mock.connects(), 2);
        assert_eq!(pool.status().total, 2);
        assert!(third.simple_query("SELECT 1").await.is_ok());

        drop(second);
        drop(third);
        assert_eq!(pool.status().idle, 2);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(
            &mock,
            PoolConfig::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_millis(30)),
        );

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PgError::Timeout(_)), "got {:?}", err);
        assert_eq!(pool.status().waiting, 0);

        drop(held);
        assert!(pool.acquire().await.is_ok());
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test]
    async fn test_acquire_with_call_timeout() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new().max_connections(1));

        let held = pool.acquire().await.unwrap();
        let err = pool
            .acquire_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Timeout(_)), "got {:?}", err);
        assert_eq!(pool.status().waiting, 0);

        drop(held);
        let conn = pool.acquire_timeout(Duration::from_millis(20)).await.unwrap();
        assert!(conn.simple_query("SELECT 1").await.is_ok());
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_grant_does_not_count_as_a_use() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new().max_connections(1).max_uses(2));

        let held = pool.acquire().await.unwrap();
        let mut pending = Box::pin(pool.acquire());
        assert!(futures::poll!(pending.as_mut()).is_pending());
        assert_eq!(pool.status().waiting, 1);

        // The release hands the client to the waiter, which then gives up
        drop(held);
        drop(pending);
        assert_eq!(
            pool.status(),
            PoolStatus {
                total: 1,
                idle: 1,
                busy: 0,
                waiting: 0
            }
        );

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.uses(), 1);
        drop(conn);
        assert_eq!(pool.status().total, 0);
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test]
    async fn test_idle_connection_failure_removes_it() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(
            &mock,
            PoolConfig::new()
                .idle_timeout(None)
                .reap_interval(Duration::from_secs(3600)),
        );

        let conn = pool.acquire().await.unwrap();
        conn.simple_query("SELECT 1").await.unwrap();
        drop(conn);
        assert_eq!(pool.status().idle, 1);

        mock.kill_all();
        wait_for(|| pool.status().total == 0).await;
        assert_eq!(pool.status().idle, 0);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.simple_query("SELECT 1").await.is_ok());
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test]
    async fn test_idle_connections_are_evicted() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(
            &mock,
            PoolConfig::new()
                .idle_timeout(Some(Duration::from_millis(30)))
                .reap_interval(Duration::from_millis(5)),
        );

        let conn = pool.acquire().await.unwrap();
        conn.simple_query("SELECT 1").await.unwrap();
        drop(conn);
        assert_eq!(pool.status().idle, 1);

        wait_for(|| pool.status().total == 0).await;
        wait_for(|| mock.log.lock().terminated == 1).await;
    }

    #[tokio::test]
    async fn test_busy_connections_are_not_evicted() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(
            &mock,
            PoolConfig::new()
                .idle_timeout(Some(Duration::from_millis(10)))
                .reap_interval(Duration::from_millis(5)),
        );

        let conn = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.status().total, 1);
        assert!(conn.simple_query("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_connection_is_destroyed() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new());

        let conn = pool.acquire().await.unwrap();
        let err = conn.simple_query("SELECT crash").await.unwrap_err();
        conn.release_with_error(&err);
        assert_eq!(pool.status().total, 0);

        // A closed client is destroyed even on a plain release
        let conn = pool.acquire().await.unwrap();
        assert!(conn.simple_query("SELECT crash").await.is_err());
        drop(conn);
        assert_eq!(pool.status().total, 0);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.simple_query("SELECT 1").await.is_ok());
        assert_eq!(mock.connects(), 3);
    }

    #[tokio::test]
    async fn test_decoder_failure_keeps_connection_pooled() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new().max_connections(1));

        let conn = pool.acquire().await.unwrap();
        let registry = TypeRegistry::new().with(Oid::INT4, Format::Text, |_| -> crate::PgResult<PgValue> {
            panic!("bad decoder")
        });
        let err = conn
            .query_with(Query::new("SELECT 1").types(registry))
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Type(_)), "got {:?}", err);
        assert!(!conn.is_closed());
        drop(conn);
        assert_eq!(pool.status().idle, 1);

        let conn = pool.acquire().await.unwrap();
        let result = conn.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.rows[0][0], PgValue::Int4(1));
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test]
    async fn test_max_uses_recycles_connection() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new().max_uses(2));

        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().total, 0);
        assert_eq!(mock.connects(), 1);

        drop(pool.acquire().await.unwrap());
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test]
    async fn test_one_shot_queries() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new());

        let result = pool.query("SELECT a, b, c", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 3);
        assert_eq!(pool.execute("UPDATE t SET x = 1", &[]).await.unwrap(), 4);
        assert_eq!(pool.simple_query("SELECT 1; SELECT 1").await.unwrap().len(), 2);
        assert!(pool.query("SELECT bogus", &[]).await.is_err());

        // Server errors do not cost the connection
        assert_eq!(pool.status().idle, 1);
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test]
    async fn test_end_rejects_waiters_and_waits_for_leases() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new().max_connections(1));

        let held = pool.acquire().await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire().await.map(|_| ()) });
        wait_for(|| pool.status().waiting == 1).await;

        let p = pool.clone();
        let ending = tokio::spawn(async move { p.end().await });

        assert!(matches!(waiter.await.unwrap(), Err(PgError::PoolShutdown)));
        assert!(matches!(pool.acquire().await, Err(PgError::PoolShutdown)));
        assert!(pool.is_ending());

        // The lease still works until it is released
        assert!(held.simple_query("SELECT 1").await.is_ok());
        drop(held);

        ending.await.unwrap();
        assert_eq!(pool.status().total, 0);
        wait_for(|| mock.log.lock().terminated == 1).await;

        // Ending again returns at once
        pool.end().await;
    }

    #[tokio::test]
    async fn test_end_closes_idle_connections() {
        let mock = MockConnector::new(Auth::Trust);
        let pool = pool(&mock, PoolConfig::new());

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.status().idle, 2);

        pool.end().await;
        assert_eq!(pool.status().total, 0);
        wait_for(|| mock.log.lock().terminated == 2).await;
    }
}

// ============================================================================
// Integration Tests (require running PostgreSQL)
// ============================================================================

#[cfg(feature = "postgres-integration-tests")]
mod integration {
    use super::*;
    use pretty_assertions::assert_eq;

    fn live_config() -> PgConfig {
        PgConfig::new("localhost", 5432, "postgres", "postgres").password("test")
    }

    #[tokio::test]
    async fn test_connect_and_simple_query() {
        let client = Client::connect(live_config()).await.unwrap();

        let result = client.simple_query("SELECT 1 as num").await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].columns.len(), 1);
        assert_eq!(result[0].columns[0].name, "num");
    }

    #[tokio::test]
    async fn test_binary_types() {
        let client = Client::connect(live_config()).await.unwrap();

        let result = client
            .query_with(
                Query::new("SELECT $1::int4, $2::int8, $3::float8, $4::bool, $5::text")
                    .params([
                        PgValue::Int4(42),
                        PgValue::Int8(9_000_000_000i64),
                        PgValue::Float8(2.5),
                        PgValue::Bool(true),
                        PgValue::Text("hello".to_string()),
                    ])
                    .binary(),
            )
            .await
            .unwrap();

        assert_eq!(result.rows[0][0], PgValue::Int4(42));
        assert_eq!(result.rows[0][1], PgValue::Int8(9_000_000_000i64));
        assert_eq!(result.rows[0][2], PgValue::Float8(2.5));
        assert_eq!(result.rows[0][3], PgValue::Bool(true));
        assert_eq!(result.rows[0][4], PgValue::Text("hello".to_string()));
    }

    #[tokio::test]
    async fn test_cursor_over_series() {
        let client = Client::connect(live_config()).await.unwrap();

        let rows: Vec<_> = client
            .query_stream("SELECT generate_series(1, 1000)", 100)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1000);
    }

    #[tokio::test]
    async fn test_pool_round_trip() {
        let pool = PgPool::new(live_config(), PoolConfig::new().max_connections(2));
        let n = pool.simple_query("SELECT 1; SELECT 2").await.unwrap();
        assert_eq!(n.len(), 2);
        pool.end().await;
    }
}
