use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Formatted log lines go to stdout and to every `/api/logs` subscriber.
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).trim_end().to_string();
        let _ = self.sender.send(msg); // no subscribers is fine
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Installs the global subscriber. Returns false if one was already set.
pub(crate) fn init(level: Level, sender: broadcast::Sender<String>, suppress_stdout: bool) -> bool {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(SseMakeWriter {
            sender,
            suppress_stdout,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
