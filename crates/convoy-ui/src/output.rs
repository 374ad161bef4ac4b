use std::{
    borrow::Cow,
    io::{self, Write},
    sync::{Arc, Mutex, RwLock},
};

/// A sink for task output that many tasks write to concurrently through
/// [`OutputClient`]s. The sink owns the real out/err writers; clients decide
/// whether their bytes stream through immediately or accumulate.
pub struct OutputSink<W> {
    writers: Arc<Mutex<SinkWriters<W>>>,
}

struct SinkWriters<W> {
    out: W,
    err: W,
}

/// One task's connection to the sink.
pub struct OutputClient<W> {
    behavior: OutputClientBehavior,
    // Written to from sync and async contexts; RwLock keeps the writer
    // handles Sync so they can be held across awaits.
    buffer: Option<RwLock<Vec<SinkBytes<'static>>>>,
    writers: Arc<Mutex<SinkWriters<W>>>,
}

pub struct OutputWriter<'a, W> {
    client: &'a OutputClient<W>,
    destination: Destination,
}

/// How a client's bytes reach the sink.
#[derive(Debug, Clone, Copy)]
pub enum OutputClientBehavior {
    /// Straight through, interleaved with other tasks.
    Passthrough,
    /// Straight through, with a copy kept for the caller.
    InMemoryBuffer,
    /// Held back entirely and emitted as one block on finish.
    Grouped,
}

#[derive(Debug, Clone, Copy)]
enum Destination {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
struct SinkBytes<'a> {
    buffer: Cow<'a, [u8]>,
    destination: Destination,
}

impl<W: Write> OutputSink<W> {
    pub fn new(out: W, err: W) -> Self {
        Self {
            writers: Arc::new(Mutex::new(SinkWriters { out, err })),
        }
    }

    /// Creates a client writing to this sink with the given behavior. Each
    /// task gets its own client; the sink serializes the actual writes.
    pub fn logger(&self, behavior: OutputClientBehavior) -> OutputClient<W> {
        let buffer = match behavior {
            OutputClientBehavior::Passthrough => None,
            OutputClientBehavior::InMemoryBuffer | OutputClientBehavior::Grouped => {
                Some(Default::default())
            }
        };
        OutputClient {
            behavior,
            buffer,
            writers: self.writers.clone(),
        }
    }
}

impl<W: Write> OutputClient<W> {
    pub fn stdout(&self) -> OutputWriter<W> {
        OutputWriter {
            client: self,
            destination: Destination::Stdout,
        }
    }

    pub fn stderr(&self) -> OutputWriter<W> {
        OutputWriter {
            client: self,
            destination: Destination::Stderr,
        }
    }

    /// Flushes held bytes (for grouped clients) and returns the captured
    /// buffer, if this client kept one.
    pub fn finish(self) -> io::Result<Option<Vec<u8>>> {
        let Self {
            behavior,
            buffer,
            writers,
        } = self;
        let buffers = buffer.map(|cell| cell.into_inner().expect("output lock poisoned"));

        if matches!(behavior, OutputClientBehavior::Grouped) {
            let buffers = buffers
                .as_ref()
                .expect("grouped output requires a buffer");
            // Hold the sink lock for the entire block so another task
            // cannot splice bytes into the middle of this group
            let mut writers = writers.lock().expect("sink lock poisoned");
            for SinkBytes {
                buffer,
                destination,
            } in buffers
            {
                let writer = match destination {
                    Destination::Stdout => &mut writers.out,
                    Destination::Stderr => &mut writers.err,
                };
                writer.write_all(buffer)?;
            }
        }

        Ok(buffers.map(|buffers| {
            let mut bytes = Vec::with_capacity(
                buffers.iter().map(|b| b.buffer.len()).sum(),
            );
            for SinkBytes { buffer, .. } in buffers {
                bytes.extend_from_slice(&buffer[..]);
            }
            bytes
        }))
    }

    fn handle_bytes(&self, bytes: SinkBytes) -> io::Result<usize> {
        if matches!(
            self.behavior,
            OutputClientBehavior::InMemoryBuffer | OutputClientBehavior::Grouped
        ) {
            let owned = SinkBytes {
                destination: bytes.destination,
                buffer: bytes.buffer.to_vec().into(),
            };
            self.buffer
                .as_ref()
                .expect("buffering behaviors allocate a buffer")
                .write()
                .expect("output lock poisoned")
                .push(owned);
        }

        if matches!(
            self.behavior,
            OutputClientBehavior::Passthrough | OutputClientBehavior::InMemoryBuffer
        ) {
            self.write_bytes(bytes)
        } else {
            // Buffered only; report the bytes as accepted
            Ok(bytes.buffer.len())
        }
    }

    fn write_bytes(&self, bytes: SinkBytes) -> io::Result<usize> {
        let SinkBytes {
            buffer: line,
            destination,
        } = bytes;
        let mut writers = self.writers.lock().expect("sink lock poisoned");
        let writer = match destination {
            Destination::Stdout => &mut writers.out,
            Destination::Stderr => &mut writers.err,
        };
        writer.write(&line)
    }
}

impl<W: Write> Write for OutputWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.client.handle_bytes(SinkBytes {
            buffer: buf.into(),
            destination: self.destination,
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        // Bytes are either already at the sink or intentionally held
        Ok(())
    }
}
