use async_trait::async_trait;
use miette::{Diagnostic, SourceSpan};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn, Instrument, Level};

mod parser;
mod response;
pub use parser::*;
pub use response::*;

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("IO error")]
    #[diagnostic(code(filter::io_error))]
    IoError(#[from] std::io::Error),

    #[error("Malformed record: {message}")]
    #[diagnostic(code(filter::malformed))]
    Malformed {
        message: String,
        #[label("This bit here")]
        span: SourceSpan,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitingHandshake,
    Operating,
    Terminated,
}

/// The filter side of the protocol: what to subscribe to and how to react.
#[async_trait]
pub trait FilterCallbacks: Send {
    /// Event streams to register for, in the order they are announced.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Returns `false` if the report was not of interest.
    async fn on_report(&mut self, report: &Report) -> bool;

    async fn on_filter(&mut self, request: &FilterRequest) -> Verdict;
}

/// Drives a [`FilterCallbacks`] implementation over a record stream.
///
/// Records are handled strictly one at a time: a filter request is answered
/// before the next line is read.
pub struct FilterServer<C> {
    callbacks: C,
    state: ServerState,
}

impl<C: FilterCallbacks> FilterServer<C> {
    pub fn new(callbacks: C) -> Self {
        FilterServer {
            callbacks,
            state: ServerState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// Runs until end of input.
    ///
    /// Read and write failures are returned; everything else wrong with the
    /// input is logged and skipped.
    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<(), FilterError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = match reader.read_until(b'\n', &mut line).await {
                Ok(n) => n,
                Err(e) => {
                    self.state = ServerState::Terminated;
                    return Err(e.into());
                }
            };

            if n == 0 {
                self.state = ServerState::Terminated;
                info!("End of input, terminating");
                return Ok(());
            }

            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                line.pop();
            }

            let text = String::from_utf8_lossy(&line);
            if let Err(e) = self.handle_line(&text, &mut writer).await {
                self.state = ServerState::Terminated;
                return Err(e);
            }
        }
    }

    /// Processes one line, writing the response it calls for, if any.
    pub async fn handle_line<W>(&mut self, line: &str, writer: &mut W) -> Result<(), FilterError>
    where
        W: AsyncWrite + Unpin,
    {
        let record = match parse_record(line) {
            Ok(record) => record,
            Err(e) => {
                self.ignore(line, &e.to_string());
                return Ok(());
            }
        };

        match (self.state, record) {
            (ServerState::AwaitingHandshake, Record::Config(ConfigLine::Ready)) => {
                self.handshake(writer).await?;
            }
            (ServerState::AwaitingHandshake, Record::Config(ConfigLine::Item { key, value })) => {
                debug!(%key, %value, "Received configuration");
            }
            (ServerState::Operating, Record::Report(report)) => {
                let span = record_span(&report.envelope, &report.params);
                if !self.callbacks.on_report(&report).instrument(span).await {
                    self.ignore(line, "unhandled report");
                }
            }
            (ServerState::Operating, Record::Filter(request)) => {
                let span = record_span(&request.envelope, &request.params);
                let verdict = self.callbacks.on_filter(&request).instrument(span).await;
                let result = FilterResult {
                    session: &request.envelope.session,
                    token: &request.token,
                    verdict: &verdict,
                };
                write_line(writer, &result.to_string()).await?;
                writer.flush().await?;
            }
            _ => self.ignore(line, "unexpected in current state"),
        }

        Ok(())
    }

    async fn handshake<W>(&mut self, writer: &mut W) -> Result<(), FilterError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut subscriptions = self.callbacks.subscriptions();
        // Reports are announced ahead of filters.
        subscriptions.sort_by_key(|s| s.kind == EventKind::Filter);

        for subscription in &subscriptions {
            write_line(writer, &subscription.to_string()).await?;
        }
        write_line(writer, REGISTER_READY).await?;
        writer.flush().await?;

        self.state = ServerState::Operating;
        info!(subscriptions = subscriptions.len(), "Completed handshake");
        Ok(())
    }

    /// Noise before the handshake is expected; after it, it points at a
    /// protocol mismatch and is logged more visibly.
    fn ignore_level(&self) -> Level {
        match self.state {
            ServerState::AwaitingHandshake => Level::DEBUG,
            _ => Level::WARN,
        }
    }

    fn ignore(&self, line: &str, reason: &str) {
        if self.ignore_level() == Level::DEBUG {
            debug!(input = line, reason, "Ignoring input");
        } else {
            warn!(input = line, reason, "Ignoring input");
        }
    }
}

fn record_span(envelope: &Envelope, params: &[String]) -> tracing::Span {
    tracing::error_span!(
        "record",
        protocol = %envelope.protocol,
        timestamp = %envelope.timestamp,
        subsystem = %envelope.subsystem,
        phase = %envelope.phase,
        session = %envelope.session,
        params = ?params,
    )
}

async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), FilterError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, BufReader, ReadBuf};

    #[derive(Default)]
    struct RecordingCallbacks {
        reports: Vec<Report>,
        requests: Vec<FilterRequest>,
    }

    #[async_trait]
    impl FilterCallbacks for RecordingCallbacks {
        fn subscriptions(&self) -> Vec<Subscription> {
            vec![
                Subscription::filter("smtp-in", "rcpt-to"),
                Subscription::report("smtp-in", "tx-mail"),
                Subscription::report("smtp-in", "link-disconnect"),
            ]
        }

        async fn on_report(&mut self, report: &Report) -> bool {
            self.reports.push(report.clone());
            !matches!(report.event, ReportEvent::Other)
        }

        async fn on_filter(&mut self, request: &FilterRequest) -> Verdict {
            self.requests.push(request.clone());
            match &request.event {
                FilterEvent::RcptTo { .. } => Verdict::reject(450, "Greylisted"),
                FilterEvent::Other => Verdict::Proceed,
            }
        }
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "broken pipe")))
        }
    }

    async fn run(input: &str) -> (FilterServer<RecordingCallbacks>, String) {
        let mut server = FilterServer::new(RecordingCallbacks::default());
        let mut output = Vec::new();
        server.run(input.as_bytes(), &mut output).await.unwrap();
        (server, String::from_utf8(output).unwrap())
    }

    #[tokio::test]
    async fn test_handshake_registers_reports_first() {
        let (server, output) = run("config|smtpd-version|7.4.0\nconfig|ready\n").await;

        assert_eq!(
            output,
            "register|report|smtp-in|tx-mail\n\
             register|report|smtp-in|link-disconnect\n\
             register|filter|smtp-in|rcpt-to\n\
             register|ready\n"
        );
        assert_eq!(server.state(), ServerState::Terminated);
    }

    #[tokio::test]
    async fn test_records_before_handshake_are_ignored() {
        let (server, output) = run(
            "report|0.7|t|smtp-in|tx-mail|S1|m|ok|a@example.com\n\
             filter|0.7|t|smtp-in|rcpt-to|S1|R1|b@example.com\n",
        )
        .await;

        assert!(output.is_empty());
        assert!(server.callbacks().reports.is_empty());
        assert!(server.callbacks().requests.is_empty());
    }

    #[tokio::test]
    async fn test_ignored_input_is_louder_after_handshake() {
        let mut server = FilterServer::new(RecordingCallbacks::default());
        let mut output = Vec::new();
        assert_eq!(server.ignore_level(), Level::DEBUG);

        server
            .handle_line("filter|0.7|t|smtp-in|rcpt-to|S1|R1|b@example.com", &mut output)
            .await
            .unwrap();
        assert_eq!(server.ignore_level(), Level::DEBUG);

        server.handle_line("config|ready", &mut output).await.unwrap();
        assert_eq!(server.state(), ServerState::Operating);
        assert_eq!(server.ignore_level(), Level::WARN);

        server.handle_line("config|ready", &mut output).await.unwrap();
        assert_eq!(server.ignore_level(), Level::WARN);
    }

    #[tokio::test]
    async fn test_filter_request_is_answered_once() {
        let (server, output) = run(
            "config|ready\n\
             filter|0.7|t|smtp-in|rcpt-to|S1|R1|b@example.com\n",
        )
        .await;

        assert!(output.ends_with("register|ready\nfilter-result|S1|R1|reject|450 Greylisted\n"));
        assert_eq!(server.callbacks().requests.len(), 1);
    }

    #[tokio::test]
    async fn test_reports_are_not_answered() {
        let (server, output) = run(
            "config|ready\n\
             report|0.7|t|smtp-in|tx-mail|S1|m|ok|a@example.com\n\
             report|0.7|t|smtp-in|link-disconnect|S1\n\
             report|0.7|t|smtp-in|link-connect|S1|rdns|pass|1.2.3.4:1|5.6.7.8:25\n",
        )
        .await;

        assert!(output.ends_with("register|ready\n"));
        assert_eq!(server.callbacks().reports.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_lines_produce_no_output() {
        let (server, output) = run(
            "config|ready\n\
             filter|0.7|t|smtp-in|rcpt-to|S1\n\
             report|0.7\n\
             \n\
             nonsense\n",
        )
        .await;

        assert!(output.ends_with("register|ready\n"));
        assert!(server.callbacks().reports.is_empty());
        assert!(server.callbacks().requests.is_empty());
    }

    #[tokio::test]
    async fn test_second_ready_is_ignored() {
        let (_, output) = run("config|ready\nconfig|ready\n").await;
        assert_eq!(output.matches(REGISTER_READY).count(), 1);
    }

    #[tokio::test]
    async fn test_crlf_and_missing_final_newline() {
        let (server, output) = run(
            "config|ready\r\n\
             filter|0.7|t|smtp-in|helo|S2|R2|mx.example.com",
        )
        .await;

        assert!(output.ends_with("filter-result|S2|R2|proceed\n"));
        assert_eq!(
            server.callbacks().requests[0].params,
            vec!["mx.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_not_fatal() {
        let mut server = FilterServer::new(RecordingCallbacks::default());
        let mut output = Vec::new();
        let input: &[u8] = b"config|ready\nfilter|0.7|t|smtp-in|rcpt-to|S1|R1|b\xff@example.com\n";

        server.run(input, &mut output).await.unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.ends_with("filter-result|S1|R1|reject|450 Greylisted\n"));
    }

    #[tokio::test]
    async fn test_read_error_terminates() {
        let mut server = FilterServer::new(RecordingCallbacks::default());
        let mut output = Vec::new();

        let result = server.run(BufReader::new(FailingReader), &mut output).await;

        assert!(matches!(result, Err(FilterError::IoError(_))));
        assert_eq!(server.state(), ServerState::Terminated);
        assert!(output.is_empty());
    }
}
