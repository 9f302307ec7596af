/// Child stdio plumbing
///
/// Output pipes are drained by one reader thread per stream, so a chatty
/// child never blocks on a full pipe while the caller is busy elsewhere.
/// Stdin is fed by a writer thread; `send` only queues.
use crate::config::types::{MarksError, StdinSource};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use std::io::{BufRead, BufReader, Read, Write};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Outcome of a single line read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(Vec<u8>),
    Eof,
    TimedOut,
}

/// Line-oriented view of one child output stream
pub struct LineReader {
    rx: Receiver<Vec<u8>>,
    eof: bool,
    thread: Option<JoinHandle<()>>,
}

impl LineReader {
    pub fn spawn<R: Read + Send + 'static>(source: R, label: String) -> Self {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name(label.clone())
            .spawn(move || pump_lines(source, tx, &label))
            .ok();
        Self {
            rx,
            eof: thread.is_none(),
            thread,
        }
    }

    /// A reader for a stream that was never opened
    pub fn closed() -> Self {
        let (_, rx) = unbounded();
        Self {
            rx,
            eof: true,
            thread: None,
        }
    }

    /// Next line including its trailing newline (the final line may lack one).
    ///
    /// `deadline == None` blocks until data or end-of-file.
    pub fn read_line(&mut self, deadline: Option<Instant>) -> LineRead {
        if self.eof {
            return LineRead::Eof;
        }

        let received = match deadline {
            Some(deadline) => self.rx.recv_deadline(deadline),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(line) => LineRead::Line(line),
            Err(RecvTimeoutError::Disconnected) => {
                self.eof = true;
                LineRead::Eof
            }
            Err(RecvTimeoutError::Timeout) => LineRead::TimedOut,
        }
    }

    /// Collect everything left in the stream.
    ///
    /// Returns the bytes and whether end-of-file was reached before the deadline.
    pub fn drain(&mut self, deadline: Option<Instant>) -> (Vec<u8>, bool) {
        let mut collected = Vec::new();
        loop {
            match self.read_line(deadline) {
                LineRead::Line(line) => collected.extend_from_slice(&line),
                LineRead::Eof => return (collected, true),
                LineRead::TimedOut => return (collected, false),
            }
        }
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        // The pipe closes once every writer in the child's tree is gone;
        // joining earlier could hang on an escaped grandchild.
        if let Some(handle) = self.thread.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn pump_lines<R: Read>(source: R, tx: Sender<Vec<u8>>, label: &str) {
    let mut reader = BufReader::new(source);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("{} reader stopped: {}", label, e);
                break;
            }
        }
    }
}

/// Queue-backed writer for a child's stdin
pub struct InputWriter {
    pid: i32,
    tx: Option<Sender<Vec<u8>>>,
    thread: Option<JoinHandle<()>>,
}

impl InputWriter {
    /// Start the writer; `initial` is written before anything queued later.
    pub fn spawn<W: Write + Send + 'static>(
        pid: i32,
        sink: W,
        initial: Option<StdinSource>,
    ) -> Self {
        let (tx, rx) = unbounded::<Vec<u8>>();
        let thread = thread::Builder::new()
            .name(format!("stdin-{}", pid))
            .spawn(move || feed_input(pid, sink, initial, rx))
            .ok();
        Self {
            pid,
            tx: Some(tx),
            thread,
        }
    }

    /// A writer whose input is already closed
    pub fn closed(pid: i32) -> Self {
        Self {
            pid,
            tx: None,
            thread: None,
        }
    }

    /// Queue bytes for the child. Never blocks on a full pipe.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), MarksError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(MarksError::InputClosed { pid: self.pid })?;
        if tx.send(bytes).is_err() {
            // The child closed its stdin; the data is simply lost, as with a pipe.
            debug!("Process {} no longer reads its input", self.pid);
        }
        Ok(())
    }

    /// Close stdin once queued data is written. Idempotent.
    pub fn finish(&mut self) {
        self.tx.take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for InputWriter {
    fn drop(&mut self) {
        self.finish();
        if let Some(handle) = self.thread.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn feed_input<W: Write>(
    pid: i32,
    mut sink: W,
    initial: Option<StdinSource>,
    rx: Receiver<Vec<u8>>,
) {
    let written = match initial {
        Some(StdinSource::Bytes(bytes)) => sink.write_all(&bytes),
        Some(StdinSource::File(path)) => std::fs::File::open(&path)
            .and_then(|mut file| std::io::copy(&mut file, &mut sink).map(|_| ())),
        None => Ok(()),
    };
    if let Err(e) = written.and_then(|_| sink.flush()) {
        debug!("Initial input to {} not fully written: {}", pid, e);
        return;
    }

    for chunk in rx {
        if let Err(e) = sink.write_all(&chunk).and_then(|_| sink.flush()) {
            debug!("Input to {} stopped: {}", pid, e);
            return;
        }
    }
    // Dropping `sink` closes the pipe: end-of-file for the child.
}
