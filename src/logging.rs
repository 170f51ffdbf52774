use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Copies every formatted log line into a file as well as stderr. Stdout is left
/// to command output.
#[derive(Clone)]
pub(crate) struct TeeMakeWriter {
    file: Arc<Mutex<File>>,
}

impl TeeMakeWriter {
    pub(crate) fn open(log_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("office.log"))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
        }
    }
}

pub(crate) struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(buf);
        }
        std::io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut file) = self.file.lock() {
            file.flush()?;
        }
        std::io::stderr().flush()
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. With a log directory, lines are also appended
/// to `<log_dir>/office.log`.
pub(crate) fn init(log_dir: Option<&Path>) {
    let tee = log_dir.and_then(|dir| match TeeMakeWriter::open(dir) {
        Ok(writer) => Some(writer),
        Err(e) => {
            eprintln!("Cannot open log file in {:?}: {}", dir, e);
            None
        }
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter());
    let installed = match tee {
        Some(writer) => builder.with_ansi(false).with_writer(writer).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_appends_to_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let tee = TeeMakeWriter::open(&dir.path().join("logs")).unwrap();
        let mut writer = tee.make_writer();
        writer.write_all(b"[Heartbeat] tick\n").unwrap();
        writer.flush().unwrap();
        let mut again = tee.make_writer();
        again.write_all(b"[Missions] idle\n").unwrap();

        let written = std::fs::read_to_string(dir.path().join("logs").join("office.log")).unwrap();
        assert_eq!(written, "[Heartbeat] tick\n[Missions] idle\n");
    }
}
