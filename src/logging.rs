//! Packet-level callback logging.
//!
//! Servers and the poll engine log through the `log` crate; clients
//! can additionally carry a [`CallbackLogger`] that hands formatted
//! request/response lines (or raw hex dumps) to an
//! application-supplied callback. This keeps wire-level tracing out of
//! the global logger and lets embedding applications route it to their
//! own sinks.

use std::sync::Arc;

/// Severity of a callback log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// What a packet log line contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Raw hex dump only.
    Raw,
    /// Interpreted fields only.
    Interpreted,
    /// Interpreted at info level plus raw at debug level.
    Both,
}

/// Callback receiving a log level and a formatted message.
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that forwards formatted packet traces to a callback.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Logger printing to stdout/stderr with timestamps.
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                _ => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Logger that discards everything.
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(callback) = &self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Hex dump of raw frame bytes.
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }
        self.log(
            level,
            &format!(
                "{} frame ({} bytes): {}",
                direction,
                data.len(),
                hex_dump(data)
            ),
        );
    }

    /// Log an outgoing request.
    pub fn log_request(&self, unit_id: u8, function: u8, address: u16, quantity: u16, data: &[u8]) {
        match self.mode {
            LoggingMode::Raw => {
                self.info(&format!(
                    "request -> unit {} fc 0x{:02X} data: {}",
                    unit_id,
                    function,
                    hex_dump(data)
                ));
            }
            LoggingMode::Interpreted => {
                self.info(&format!(
                    "request -> unit {} {} ({}) addr {} qty {}",
                    unit_id,
                    function_name(function),
                    function,
                    address,
                    quantity
                ));
            }
            LoggingMode::Both => {
                self.info(&format!(
                    "request -> unit {} {} ({}) addr {} qty {}",
                    unit_id,
                    function_name(function),
                    function,
                    address,
                    quantity
                ));
                self.debug(&format!("request -> raw data: {}", hex_dump(data)));
            }
        }
    }

    /// Log a received response.
    pub fn log_response(&self, unit_id: u8, function: u8, data: &[u8]) {
        match self.mode {
            LoggingMode::Raw => {
                self.info(&format!(
                    "response <- unit {} fc 0x{:02X} data: {}",
                    unit_id,
                    function,
                    hex_dump(data)
                ));
            }
            LoggingMode::Interpreted => {
                self.info(&format!(
                    "response <- unit {} {} {}",
                    unit_id,
                    function_name(function),
                    interpret_response(function, data)
                ));
            }
            LoggingMode::Both => {
                self.info(&format!(
                    "response <- unit {} {} {}",
                    unit_id,
                    function_name(function),
                    interpret_response(function, data)
                ));
                self.debug(&format!("response <- raw data: {}", hex_dump(data)));
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn hex_dump(data: &[u8]) -> String {
    hex::encode_upper(data)
}

fn function_name(function: u8) -> &'static str {
    match function & 0x7F {
        0x01 => "Read Coils",
        0x02 => "Read Discrete Inputs",
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x05 => "Write Single Coil",
        0x06 => "Write Single Register",
        0x0F => "Write Multiple Coils",
        0x10 => "Write Multiple Registers",
        0x11 => "Report Server ID",
        0x17 => "Read/Write Multiple Registers",
        _ => "Unknown Function",
    }
}

fn interpret_response(function: u8, data: &[u8]) -> String {
    match function {
        0x01 | 0x02 if !data.is_empty() => {
            format!("byte count {} bits {}", data[0], hex_dump(&data[1..]))
        }
        0x03 | 0x04 | 0x17 if !data.is_empty() => {
            let registers: Vec<String> = data[1..]
                .chunks_exact(2)
                .take(8)
                .map(|c| format!("{:04X}", u16::from_be_bytes([c[0], c[1]])))
                .collect();
            format!("byte count {} registers [{}]", data[0], registers.join(" "))
        }
        0x05 | 0x06 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!("addr {} value 0x{:04X}", address, value)
        }
        0x0F | 0x10 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let quantity = u16::from_be_bytes([data[2], data[3]]);
            format!("addr {} qty {}", address, quantity)
        }
        _ => format!("data {}", hex_dump(data)),
    }
}

/// Build a console logger.
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_logger(mode: LoggingMode) -> (Arc<Mutex<Vec<String>>>, CallbackLogger) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |_, message| {
            sink.lock().unwrap().push(message.to_string());
        });
        (
            lines,
            CallbackLogger::with_mode(Some(callback), LogLevel::Debug, mode),
        )
    }

    #[test]
    fn test_level_filtering() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |_, message| {
            sink.lock().unwrap().push(message.to_string());
        });
        let logger = CallbackLogger::new(Some(callback), LogLevel::Warn);

        logger.error("e");
        logger.warn("w");
        logger.info("i");
        logger.debug("d");
        assert_eq!(*lines.lock().unwrap(), vec!["e", "w"]);
    }

    #[test]
    fn test_interpreted_request_line() {
        let (lines, logger) = collecting_logger(LoggingMode::Interpreted);
        logger.log_request(7, 0x03, 11, 13, &[]);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Read Holding Registers"));
        assert!(lines[0].contains("addr 11"));
        assert!(lines[0].contains("qty 13"));
    }

    #[test]
    fn test_raw_response_line() {
        let (lines, logger) = collecting_logger(LoggingMode::Raw);
        logger.log_response(7, 0x03, &[0x04, 0x00, 0x2A, 0x00, 0x14]);
        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("04002A0014"));
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = CallbackLogger::disabled();
        // No callback; should be a no-op.
        logger.error("never seen");
        logger.log_packet(LogLevel::Error, "TX", &[1, 2, 3]);
    }
}
