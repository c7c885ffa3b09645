use crate::config::{IMPLICIT_TLS_PORT, MailConfig, SmtpSettings};
use crate::telemetry::Telemetry;
use crate::template::{Greeting, Overrides};
use lettre::message::{Mailbox, MultiPart, SinglePart, header::ContentType};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{SmtpConnection, Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{Message, SmtpTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// How the connection is secured before authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSecurity {
    /// TLS handshake first, SMTP inside it.
    ImplicitTls,
    /// Plaintext, upgraded with STARTTLS when the server offers it.
    Opportunistic,
}

impl ConnectionSecurity {
    pub fn for_port(port: u16) -> Self {
        if port == IMPLICIT_TLS_PORT {
            Self::ImplicitTls
        } else {
            Self::Opportunistic
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Skipped { missing: Vec<&'static str> },
    Failed,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Puts a finished message on the wire.
pub trait Dispatch {
    fn dispatch(
        &self,
        settings: &SmtpSettings,
        security: ConnectionSecurity,
        message: &Message,
    ) -> Result<(), MailError>;
}

pub struct SmtpDispatch;

impl Dispatch for SmtpDispatch {
    fn dispatch(
        &self,
        settings: &SmtpSettings,
        security: ConnectionSecurity,
        message: &Message,
    ) -> Result<(), MailError> {
        match security {
            ConnectionSecurity::ImplicitTls => {
                create_transport(settings)?.send(message)?;
            }
            ConnectionSecurity::Opportunistic => send_opportunistic(settings, message)?,
        }
        Ok(())
    }
}

/// Transport for implicit TLS: the handshake happens before any SMTP.
pub fn create_transport(settings: &SmtpSettings) -> Result<SmtpTransport, MailError> {
    let params = TlsParameters::new(settings.server.clone())?;

    let transport = SmtpTransport::builder_dangerous(&settings.server)
        .port(settings.port)
        .tls(Tls::Wrapper(params))
        .credentials(credentials(settings))
        .timeout(Some(TIMEOUT))
        .build();

    Ok(transport)
}

fn credentials(settings: &SmtpSettings) -> Credentials {
    Credentials::new(settings.username.clone(), settings.password.clone())
}

fn connect_plain(settings: &SmtpSettings, hello: &ClientId) -> Result<SmtpConnection, MailError> {
    let conn = SmtpConnection::connect(
        (settings.server.as_str(), settings.port),
        Some(TIMEOUT),
        hello,
        None,
        None,
    )?;
    Ok(conn)
}

/// Plaintext session, upgraded with STARTTLS when the server offers it.
///
/// lettre drops the connection after a refused STARTTLS, so a refusal
/// (any 4xx/5xx reply) reconnects and carries on without encryption. A
/// failed handshake after the server agreed is still an error.
pub fn send_opportunistic(settings: &SmtpSettings, message: &Message) -> Result<(), MailError> {
    let hello = ClientId::default();
    let mut conn = connect_plain(settings, &hello)?;

    if conn.can_starttls() {
        let params = TlsParameters::new(settings.server.clone())?;
        match conn.starttls(&params, &hello) {
            Ok(()) => {}
            Err(e) if e.is_transient() || e.is_permanent() => {
                warn!(error = %e, "Server refused STARTTLS; continuing without encryption");
                conn = connect_plain(settings, &hello)?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    conn.auth(AUTH_MECHANISMS, &credentials(settings))?;
    let sent = conn.send(message.envelope(), &message.formatted());
    let _ = conn.quit();
    sent?;
    Ok(())
}

pub fn build_message(settings: &SmtpSettings, greeting: &Greeting) -> Result<Message, MailError> {
    let from: Mailbox = settings.from.parse()?;
    let to: Mailbox = settings.to.parse()?;

    let msg_id = format!(
        "<{}.{}@{}>",
        uuid::Uuid::new_v4(),
        chrono::Utc::now().timestamp(),
        from.email.domain()
    );

    let alternative = MultiPart::alternative()
        .singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(greeting.plain.clone()),
        )
        .singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(greeting.html.clone()),
        );

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(greeting.subject.clone())
        .message_id(Some(msg_id))
        .multipart(alternative)?;

    Ok(message)
}

/// Composes and delivers the morning note, one independent attempt per call.
pub struct Mailer<D = SmtpDispatch> {
    config: MailConfig,
    dispatch: D,
    telemetry: Arc<Telemetry>,
}

impl Mailer<SmtpDispatch> {
    pub fn new(config: MailConfig, telemetry: Arc<Telemetry>) -> Self {
        Self::with_dispatch(config, SmtpDispatch, telemetry)
    }
}

impl<D: Dispatch> Mailer<D> {
    pub fn with_dispatch(config: MailConfig, dispatch: D, telemetry: Arc<Telemetry>) -> Self {
        Self {
            config,
            dispatch,
            telemetry,
        }
    }

    /// Never returns an error: every failure is logged (and reported) here.
    pub fn send(&self) -> SendOutcome {
        let settings = match self.config.smtp() {
            Ok(settings) => settings,
            Err(missing) => {
                error!(
                    missing = %missing.join(", "),
                    "Missing one or more required SMTP environment variables"
                );
                return SendOutcome::Skipped { missing };
            }
        };

        let greeting = Greeting::compose(&self.config.to_name, &Overrides::from(&self.config));
        let security = ConnectionSecurity::for_port(settings.port);

        let result = build_message(&settings, &greeting)
            .and_then(|message| self.dispatch.dispatch(&settings, security, &message));

        match result {
            Ok(()) => {
                info!("Email sent to {}", settings.to);
                SendOutcome::Sent
            }
            Err(e) => {
                error!(error = ?e, "Failed to send email to {}: {}", settings.to, e);
                self.telemetry.report(&e);
                SendOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::capture::Captured;
    use crate::telemetry::{ErrorReporter, ReportError};
    use std::collections::HashMap;
    use std::io::{self, BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<(ConnectionSecurity, u16)>>>,
        fail: bool,
    }

    impl Dispatch for Recording {
        fn dispatch(
            &self,
            settings: &SmtpSettings,
            security: ConnectionSecurity,
            _message: &Message,
        ) -> Result<(), MailError> {
            self.calls.lock().unwrap().push((security, settings.port));
            if self.fail {
                let err = "rejected".parse::<lettre::Address>().unwrap_err();
                return Err(MailError::Address(err));
            }
            Ok(())
        }
    }

    struct Panicking(Arc<AtomicUsize>);

    impl ErrorReporter for Panicking {
        fn capture_error(&self, _: &(dyn std::error::Error + 'static)) -> Result<(), ReportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("reporter down")
        }

        fn capture_panic(&self, _: &str) -> Result<(), ReportError> {
            Ok(())
        }
    }

    fn config(pairs: &[(&str, &str)]) -> MailConfig {
        let mut vars: HashMap<String, String> = [
            ("SMTP_SERVER", "smtp.example.com"),
            ("SMTP_USERNAME", "me@example.com"),
            ("SMTP_PASSWORD", "hunter2"),
            ("FROM_EMAIL", "me@example.com"),
            ("TO_EMAIL", "you@example.com"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            if v.is_empty() {
                vars.remove(*k);
            } else {
                vars.insert(k.to_string(), v.to_string());
            }
        }
        MailConfig::from_vars(vars).unwrap()
    }

    fn settings() -> SmtpSettings {
        config(&[]).smtp().unwrap()
    }

    /// Local SMTP server that advertises STARTTLS, refuses it with 454 and
    /// otherwise accepts everything. Records every command line it sees.
    fn starttls_refusing_server() -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let transcript = Arc::new(Mutex::new(Vec::new()));
        let seen = transcript.clone();
        thread::spawn(move || {
            for stream in listener.incoming().take(2) {
                let Ok(stream) = stream else { return };
                let _ = serve_session(stream, &seen);
            }
        });
        (port, transcript)
    }

    fn serve_session(stream: TcpStream, seen: &Mutex<Vec<String>>) -> io::Result<()> {
        let mut out = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        out.write_all(b"220 localhost ESMTP\r\n")?;

        let mut in_data = false;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let command = line.trim_end().to_string();
            if in_data {
                if command == "." {
                    in_data = false;
                    out.write_all(b"250 2.0.0 Queued\r\n")?;
                }
                continue;
            }
            seen.lock().unwrap().push(command.clone());

            let verb = command
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            let reply = match verb.as_str() {
                "EHLO" => "250-localhost\r\n250-STARTTLS\r\n250 AUTH PLAIN LOGIN\r\n",
                "STARTTLS" => "454 4.7.0 TLS not available\r\n",
                "AUTH" => "235 2.7.0 Authentication successful\r\n",
                "MAIL" | "RCPT" => "250 2.1.0 Ok\r\n",
                "DATA" => {
                    in_data = true;
                    "354 End data with <CR><LF>.<CR><LF>\r\n"
                }
                "QUIT" => {
                    let _ = out.write_all(b"221 2.0.0 Bye\r\n");
                    return Ok(());
                }
                _ => "502 5.5.2 Command not recognized\r\n",
            };
            out.write_all(reply.as_bytes())?;
        }
    }

    #[test]
    fn implicit_tls_only_on_465() {
        assert_eq!(ConnectionSecurity::for_port(465), ConnectionSecurity::ImplicitTls);
        assert_eq!(ConnectionSecurity::for_port(587), ConnectionSecurity::Opportunistic);
        assert_eq!(ConnectionSecurity::for_port(25), ConnectionSecurity::Opportunistic);
    }

    #[test]
    fn missing_setting_skips_without_dispatch_and_logs_once() {
        for key in [
            "SMTP_SERVER",
            "SMTP_USERNAME",
            "SMTP_PASSWORD",
            "FROM_EMAIL",
            "TO_EMAIL",
        ] {
            let dispatch = Recording::default();
            let mailer = Mailer::with_dispatch(
                config(&[(key, "")]),
                dispatch.clone(),
                Arc::new(Telemetry::disabled()),
            );
            let captured = Captured::default();
            let outcome = tracing::subscriber::with_default(captured.subscriber(), || mailer.send());

            assert_eq!(outcome, SendOutcome::Skipped { missing: vec![key] });
            assert!(dispatch.calls.lock().unwrap().is_empty());
            assert_eq!(captured.count("ERROR"), 1);
            assert_eq!(captured.lines().len(), 1);
        }
    }

    #[test]
    fn default_port_dispatches_over_implicit_tls() {
        let dispatch = Recording::default();
        let mailer =
            Mailer::with_dispatch(config(&[]), dispatch.clone(), Arc::new(Telemetry::disabled()));
        assert!(mailer.send().is_sent());
        assert_eq!(
            *dispatch.calls.lock().unwrap(),
            vec![(ConnectionSecurity::ImplicitTls, 465)]
        );
    }

    #[test]
    fn other_port_dispatches_opportunistically() {
        let dispatch = Recording::default();
        let mailer = Mailer::with_dispatch(
            config(&[("SMTP_PORT", "587")]),
            dispatch.clone(),
            Arc::new(Telemetry::disabled()),
        );
        assert!(mailer.send().is_sent());
        assert_eq!(
            *dispatch.calls.lock().unwrap(),
            vec![(ConnectionSecurity::Opportunistic, 587)]
        );
    }

    #[test]
    fn refused_starttls_still_delivers_in_plaintext() {
        let (port, transcript) = starttls_refusing_server();
        let port = port.to_string();
        let mailer = Mailer::new(
            config(&[("SMTP_SERVER", "127.0.0.1"), ("SMTP_PORT", &port)]),
            Arc::new(Telemetry::disabled()),
        );

        let captured = Captured::default();
        let outcome = tracing::subscriber::with_default(captured.subscriber(), || mailer.send());

        assert_eq!(outcome, SendOutcome::Sent);
        let seen = transcript.lock().unwrap().clone();
        assert!(seen.iter().any(|c| c == "STARTTLS"), "{seen:?}");
        assert!(seen.iter().any(|c| c.starts_with("AUTH PLAIN")), "{seen:?}");
        assert!(seen.iter().any(|c| c.starts_with("MAIL FROM:<me@example.com>")), "{seen:?}");
        assert!(seen.iter().any(|c| c.starts_with("RCPT TO:<you@example.com>")), "{seen:?}");
        assert_eq!(seen.iter().filter(|c| c.as_str() == "STARTTLS").count(), 1);
        assert_eq!(captured.count("WARN"), 1);
        assert_eq!(captured.count("ERROR"), 0);
    }

    #[test]
    fn each_send_is_an_independent_attempt() {
        let dispatch = Recording::default();
        let mailer =
            Mailer::with_dispatch(config(&[]), dispatch.clone(), Arc::new(Telemetry::disabled()));
        mailer.send();
        mailer.send();
        assert_eq!(dispatch.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn delivery_failure_is_reported_and_swallowed() {
        let reports = Arc::new(AtomicUsize::new(0));
        let telemetry = Arc::new(Telemetry::new(Some(Box::new(Panicking(reports.clone())))));
        let dispatch = Recording {
            fail: true,
            ..Default::default()
        };
        let mailer = Mailer::with_dispatch(config(&[]), dispatch, telemetry);

        let captured = Captured::default();
        let outcome = tracing::subscriber::with_default(captured.subscriber(), || mailer.send());

        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        let lines = captured.lines();
        assert!(lines.iter().any(|l| l.contains("Failed to send email to you@example.com")));
        assert!(lines.iter().any(|l| l.contains("reporter down")));
    }

    #[test]
    fn message_carries_headers_and_both_parts() {
        let greeting = Greeting::compose("Ada", &Overrides::default());
        let message = build_message(&settings(), &greeting).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Subject: A Morning Note for my Ada"));
        assert!(raw.contains("From: me@example.com"));
        assert!(raw.contains("To: you@example.com"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
        assert!(raw.contains("@example.com>"));
    }

    #[test]
    fn invalid_recipient_fails_to_build() {
        let mut s = settings();
        s.to = "not an address".into();
        let greeting = Greeting::compose("Ada", &Overrides::default());
        assert!(matches!(
            build_message(&s, &greeting),
            Err(MailError::Address(_))
        ));
    }
}
