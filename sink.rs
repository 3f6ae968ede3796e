use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Destination of one sensor's record stream.
///
/// With a data directory every sensor gets its own text file for the run's
/// duration; without one, records go to stderr. Line-buffered so a record
/// hits the disk as soon as its newline is written.
pub enum RecordSink {
    Stderr(io::Stderr),
    File(LineWriter<File>),
}

impl RecordSink {
    pub fn open(dir: Option<&Path>, filename: &str) -> io::Result<RecordSink> {
        match dir {
            None => Ok(RecordSink::Stderr(io::stderr())),
            Some(dir) => {
                let file = File::create(dir.join(filename))?;
                Ok(RecordSink::File(LineWriter::new(file)))
            }
        }
    }
}

impl Write for RecordSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RecordSink::Stderr(out) => out.write(buf),
            RecordSink::File(out) => out.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RecordSink::Stderr(out) => out.flush(),
            RecordSink::File(out) => out.flush(),
        }
    }
}

/// Seconds since the Unix epoch, the timestamp carried by every record.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
