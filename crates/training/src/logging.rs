use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{ValidationSummary, WindowSummary},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub log_file: Option<PathBuf>,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            log_file: config.log_file.clone(),
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Renders a display-window summary. `loss` and the error rates are averages
/// over every batch since the previous TRAIN line, not the last batch alone.
pub fn format_train_line(iteration: u64, lr: f64, window: &WindowSummary) -> String {
    format!(
        "TRAIN Iter {}: lr = {:.6}, loss = {:.6}, Top-1 err = {:.6}, Top-5 err = {:.6}, data_time = {:.6}, train_time = {:.6}",
        iteration,
        lr,
        window.loss,
        window.top1_err,
        window.top5_err,
        window.data_time,
        window.train_time
    )
}

pub fn format_test_line(summary: &ValidationSummary) -> String {
    format!(
        "TEST Iter {}: loss = {:.6}, Top-1 err = {:.6}, Top-5 err = {:.6}, val_time = {:.6}",
        summary.iteration,
        summary.loss,
        summary.top1_err,
        summary.top5_err,
        summary.duration.as_secs_f64()
    )
}

/// Fans TRAIN/TEST events out to the `log` facade, a plain-text log file and
/// TensorBoard.
pub struct Logger {
    settings: LoggingSettings,
    line_file: Option<LineWriter>,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let line_file = match settings.log_file.as_ref() {
            Some(path) => Some(LineWriter::open(path)?),
            None => None,
        };
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            line_file,
            tensorboard,
        })
    }

    pub fn log_training_window(
        &mut self,
        iteration: u64,
        lr: f64,
        window: &WindowSummary,
        loss_ema: f64,
    ) -> Result<(), TrainingError> {
        let line = format_train_line(iteration, lr, window);
        self.emit(&line)?;

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = iteration as i64;
            writer.write_scalar("train/lr", step, lr)?;
            writer.write_scalar("train/loss", step, window.loss)?;
            writer.write_scalar("train/loss_ema", step, loss_ema)?;
            writer.write_scalar("train/top1_err", step, window.top1_err)?;
            writer.write_scalar("train/top5_err", step, window.top5_err)?;
        }
        Ok(())
    }

    pub fn log_validation(&mut self, summary: &ValidationSummary) -> Result<(), TrainingError> {
        let line = format_test_line(summary);
        self.emit(&line)?;

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = summary.iteration as i64;
            writer.write_scalar("val/loss", step, summary.loss)?;
            writer.write_scalar("val/top1_err", step, summary.top1_err)?;
            writer.write_scalar("val/top5_err", step, summary.top5_err)?;
        }
        Ok(())
    }

    /// Plain status message; goes to stdout and the log file like the metric lines.
    pub fn log_message(&mut self, message: &str) -> Result<(), TrainingError> {
        self.emit(message)
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        if let Some(writer) = self.tensorboard.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn emit(&mut self, line: &str) -> Result<(), TrainingError> {
        if self.settings.enable_stdout {
            log::info!("{line}");
        }
        if let Some(file) = self.line_file.as_mut() {
            file.write_line(line)?;
        }
        Ok(())
    }
}

struct LineWriter {
    path: PathBuf,
    file: File,
}

impl LineWriter {
    fn open(path: &Path) -> Result<Self, TrainingError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to create log directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to open log file {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn write_line(&mut self, line: &str) -> Result<(), TrainingError> {
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.flush())
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to write log file {}: {err}",
                    self.path.display()
                ))
            })
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    /// TFRecord framing: length, masked crc of length, payload, masked crc of payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn window() -> WindowSummary {
        WindowSummary {
            loss: 0.5,
            top1_err: 0.25,
            top5_err: 0.0,
            data_time: 0.001,
            train_time: 0.02,
            batches: 20,
        }
    }

    #[test]
    fn train_line_has_fixed_layout() {
        assert_eq!(
            format_train_line(40, 0.0001, &window()),
            "TRAIN Iter 40: lr = 0.000100, loss = 0.500000, Top-1 err = 0.250000, \
             Top-5 err = 0.000000, data_time = 0.001000, train_time = 0.020000"
        );
    }

    #[test]
    fn test_line_has_fixed_layout() {
        let summary = ValidationSummary {
            iteration: 10_000,
            loss: 1.25,
            top1_err: 0.5,
            top5_err: 0.125,
            duration: Duration::from_millis(1500),
        };
        assert_eq!(
            format_test_line(&summary),
            "TEST Iter 10000: loss = 1.250000, Top-1 err = 0.500000, Top-5 err = 0.125000, val_time = 1.500000"
        );
    }

    #[test]
    fn writes_lines_and_event_records() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let log_file = dir.path().join("logs").join("train.log");
        let tb_dir = dir.path().join("tb");
        let mut logger = Logger::new(LoggingSettings {
            enable_stdout: false,
            log_file: Some(log_file.clone()),
            tensorboard_dir: Some(tb_dir.clone()),
            tensorboard_flush_every_n: 100,
        })?;

        logger.log_training_window(20, 0.1, &window(), 0.6)?;
        logger.log_message("resumed")?;
        logger.flush()?;

        let contents = fs::read_to_string(&log_file)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("TRAIN Iter 20:"));
        assert_eq!(lines[1], "resumed");

        let event_file = fs::read_dir(&tb_dir)?
            .next()
            .ok_or_else(|| TrainingError::runtime("no event file"))??
            .path();
        let bytes = fs::read(event_file)?;
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[..8]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[8..12]);
        assert_eq!(u32::from_le_bytes(crc), masked_crc32(&len));
        let payload_len = u64::from_le_bytes(len) as usize;
        let event = Event::decode(&bytes[12..12 + payload_len])
            .map_err(|err| TrainingError::runtime(err.to_string()))?;
        assert_eq!(event.step, 20);
        let value = &event.summary.ok_or_else(|| TrainingError::runtime("no summary"))?.value[0];
        assert_eq!(value.tag, "train/lr");
        Ok(())
    }
}
