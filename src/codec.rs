//! Compression strategy, picked once per job
//!
//! Both strategies speak gzip, so a stream compressed by `pigz` on one host
//! decompresses with flate2 (or `gzip`) on the other.

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

/// Compressors tried on a remote host, fastest first.
pub const REMOTE_CANDIDATES: [&str; 2] = ["pigz", "gzip"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    /// In-process gzip
    Builtin { level: u32 },
    /// Parallel gzip through an external program
    External { program: PathBuf, level: u32 },
}

impl Codec {
    /// Prefer `pigz` on PATH, fall back to the builtin encoder.
    pub fn probe(level: u32, allow_external: bool) -> Codec {
        let level = level.clamp(1, 9);
        if allow_external {
            if let Ok(program) = which::which("pigz") {
                return Codec::External { program, level };
            }
        }
        Codec::Builtin { level }
    }

    pub fn describe(&self) -> String {
        match self {
            Codec::Builtin { level } => format!("builtin gzip (level {level})"),
            Codec::External { program, level } => {
                format!("{} (level {level})", program.display())
            }
        }
    }

    /// Wrap `sink` so that bytes written come out compressed.
    pub fn compressor<W: Write + Send + 'static>(&self, sink: W) -> Result<Compressor<W>> {
        match self {
            Codec::Builtin { level } => Ok(Compressor::Builtin(GzEncoder::new(
                sink,
                Compression::new(*level),
            ))),
            Codec::External { program, level } => {
                let mut child = Command::new(program)
                    .arg("-c")
                    .arg(format!("-{level}"))
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()
                    .with_context(|| format!("spawn {}", program.display()))?;
                let stdin = child.stdin.take();
                let mut stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow!("compressor stdout not captured"))?;
                let pump = thread::spawn(move || -> io::Result<W> {
                    let mut sink = sink;
                    io::copy(&mut stdout, &mut sink)?;
                    sink.flush()?;
                    Ok(sink)
                });
                Ok(Compressor::External(PipeCompressor {
                    child,
                    stdin,
                    pump: Some(pump),
                }))
            }
        }
    }

    /// Wrap `source` so that reads return decompressed bytes.
    pub fn decompressor<R: Read + Send + 'static>(&self, source: R) -> Result<Box<dyn Read + Send>> {
        match self {
            Codec::Builtin { .. } => Ok(Box::new(MultiGzDecoder::new(source))),
            Codec::External { program, .. } => {
                let mut child = Command::new(program)
                    .arg("-dc")
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()
                    .with_context(|| format!("spawn {}", program.display()))?;
                let mut stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| anyhow!("decompressor stdin not captured"))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow!("decompressor stdout not captured"))?;
                let feeder = thread::spawn(move || -> io::Result<()> {
                    let mut source = source;
                    io::copy(&mut source, &mut stdin)?;
                    Ok(())
                });
                Ok(Box::new(PipeDecompressor {
                    child,
                    stdout,
                    feeder: Some(feeder),
                    finished: false,
                }))
            }
        }
    }
}

pub enum Compressor<W: Write> {
    Builtin(GzEncoder<W>),
    External(PipeCompressor<W>),
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Builtin(enc) => enc.write(buf),
            Compressor::External(pipe) => pipe.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Builtin(enc) => enc.flush(),
            Compressor::External(pipe) => pipe.flush(),
        }
    }
}

impl<W: Write> Compressor<W> {
    /// Flush the trailer and hand back the sink.
    pub fn finish(self) -> Result<W> {
        match self {
            Compressor::Builtin(enc) => Ok(enc.finish()?),
            Compressor::External(pipe) => pipe.finish(),
        }
    }
}

/// Child-process compressor; a pump thread drains its stdout into the sink.
pub struct PipeCompressor<W> {
    child: Child,
    stdin: Option<ChildStdin>,
    pump: Option<JoinHandle<io::Result<W>>>,
}

impl<W> Write for PipeCompressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "compressor closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl<W> PipeCompressor<W> {
    fn finish(mut self) -> Result<W> {
        // closing stdin lets the compressor emit its trailer and exit
        drop(self.stdin.take());
        let pump = self
            .pump
            .take()
            .ok_or_else(|| anyhow!("compressor already finished"))?;
        let sink = pump
            .join()
            .map_err(|_| anyhow!("compressor pump thread panicked"))?
            .context("drain compressor output")?;
        let status = self.child.wait()?;
        if !status.success() {
            return Err(anyhow!("compressor exited with {status}"));
        }
        Ok(sink)
    }
}

impl<W> Drop for PipeCompressor<W> {
    fn drop(&mut self) {
        if self.pump.is_some() {
            drop(self.stdin.take());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct PipeDecompressor {
    child: Child,
    stdout: ChildStdout,
    feeder: Option<JoinHandle<io::Result<()>>>,
    finished: bool,
}

impl PipeDecompressor {
    fn finalize(&mut self) -> io::Result<()> {
        self.finished = true;
        if let Some(feeder) = self.feeder.take() {
            match feeder.join() {
                Ok(Ok(())) => {}
                // the child may exit early on bad input; its status says why
                Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(io::Error::other("decompressor feeder panicked")),
            }
        }
        let status = self.child.wait()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("decompressor exited with {status}"),
            ));
        }
        Ok(())
    }
}

impl Read for PipeDecompressor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finalize()?;
        }
        Ok(n)
    }
}

impl Drop for PipeDecompressor {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
            if let Some(feeder) = self.feeder.take() {
                let _ = feeder.join();
            }
        }
    }
}
