use crate::common::*;

pub trait Logger: Debug + Send {
    fn line_writer(&mut self) -> Option<&mut dyn std::io::Write>;
    fn is_enabled(&self) -> bool {
        true
    }
}
#[derive(Debug)]
pub struct DummyLogger;
#[derive(Debug)]
pub struct VecLogger(String, Vec<u8>);
#[derive(Debug)]
pub struct FileLogger(String, std::fs::File);

// Handle onto the process-wide sink. Each holder assembles its line locally
// and hands the sink whole lines only, so lines from concurrent logical
// threads never interleave.
pub struct SharedLogger {
    sink: Arc<Mutex<Box<dyn Logger>>>,
    enabled: bool,
    prefix: Arc<str>,
    line: Vec<u8>,
}

fn secs_since_unix_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.)
}
impl FileLogger {
    pub fn new(process_name: impl Into<String>, file: std::fs::File) -> Self {
        Self(process_name.into(), file)
    }
}
impl VecLogger {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self(process_name.into(), Default::default())
    }
}
impl SharedLogger {
    pub fn new(sink: Box<dyn Logger>) -> Self {
        let enabled = sink.is_enabled();
        Self { sink: Arc::new(Mutex::new(sink)), enabled, prefix: "".into(), line: vec![] }
    }
    // same sink, every line additionally tagged with `prefix`
    pub fn with_prefix(&self, prefix: impl Display) -> Self {
        let prefix = if self.prefix.is_empty() {
            prefix.to_string()
        } else {
            format!("{} {}", self.prefix, prefix)
        };
        Self { sink: self.sink.clone(), enabled: self.enabled, prefix: prefix.into(), line: vec![] }
    }
    fn flush_lines(&mut self) {
        while let Some(end) = self.line.iter().position(|&b| b == b'\n') {
            let rest = self.line.split_off(end + 1);
            let line = std::mem::replace(&mut self.line, rest);
            let mut sink = self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(w) = sink.line_writer() {
                let _ = w.write_all(&line);
            }
        }
    }
}
/////////////////
impl Logger for DummyLogger {
    fn line_writer(&mut self) -> Option<&mut dyn std::io::Write> {
        None
    }
    fn is_enabled(&self) -> bool {
        false
    }
}
impl Logger for VecLogger {
    fn line_writer(&mut self) -> Option<&mut dyn std::io::Write> {
        let _ = write!(&mut self.1, "{} at {:.6} ", self.0, secs_since_unix_epoch());
        Some(self)
    }
}
impl Logger for FileLogger {
    fn line_writer(&mut self) -> Option<&mut dyn std::io::Write> {
        let _ = write!(&mut self.1, "{} at {:.6} ", self.0, secs_since_unix_epoch());
        Some(&mut self.1)
    }
}
impl Logger for SharedLogger {
    fn line_writer(&mut self) -> Option<&mut dyn std::io::Write> {
        if !self.enabled {
            return None;
        }
        if !self.prefix.is_empty() {
            let prefix = self.prefix.clone();
            let _ = write!(&mut self.line, "{} ", prefix);
        }
        Some(self)
    }
    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
///////////////////
impl Clone for SharedLogger {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            enabled: self.enabled,
            prefix: self.prefix.clone(),
            line: vec![],
        }
    }
}
impl Debug for SharedLogger {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("SharedLogger").field("prefix", &self.prefix).finish()
    }
}
impl Drop for VecLogger {
    fn drop(&mut self) {
        if self.1.is_empty() {
            return;
        }
        let stderr = std::io::stderr();
        let mut lock = stderr.lock();
        let _ = writeln!(lock, "--- DROP LOG DUMP ---");
        let _ = std::io::Write::write_all(&mut lock, self.1.as_slice());
    }
}
impl std::io::Write for VecLogger {
    fn flush(&mut self) -> Result<(), std::io::Error> {
        Ok(())
    }
    fn write(&mut self, data: &[u8]) -> Result<usize, std::io::Error> {
        self.1.extend_from_slice(data);
        Ok(data.len())
    }
}
impl std::io::Write for SharedLogger {
    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.flush_lines();
        Ok(())
    }
    fn write(&mut self, data: &[u8]) -> Result<usize, std::io::Error> {
        self.line.extend_from_slice(data);
        self.flush_lines();
        Ok(data.len())
    }
}
