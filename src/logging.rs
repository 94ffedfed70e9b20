//! Log dispatch: colored stdout plus an optional gateway mirror.
//!
//! Diagnostics go through the `log` facade; a deployment that wants them
//! in syslog chains its own logger instead. When a command interface is
//! active, every line is additionally kept in a [`GatewayMirror`] with a
//! plain timestamp prefix, and the runtime feeds those lines to the ASCII
//! engine once per mainline tick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};

use colored::Color;
use fern::colors::ColoredLevelConfig;
use log::LevelFilter;

use crate::gateway::AsciiEngine;

const MIRROR_CAPACITY: usize = 64;

/// Shared buffer of recent log lines destined for the gateway engine.
#[derive(Clone)]
pub struct GatewayMirror {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl GatewayMirror {
    pub fn new() -> Self {
        GatewayMirror {
            lines: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= MIRROR_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Move all buffered lines into the engine's log.
    pub fn drain_into(&self, engine: &mut dyn AsciiEngine) {
        let mut lines = self.lines.lock().unwrap();
        while let Some(line) = lines.pop_front() {
            engine.log_line(&line);
        }
    }
}

impl Default for GatewayMirror {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the process-wide logger. Safe to call more than once; only the
/// first call takes effect.
pub fn init(level: LevelFilter, mirror: Option<GatewayMirror>) {
    static INIT: Once = Once::new();
    INIT.call_once(move || {
        let colors_line = ColoredLevelConfig::new()
            .error(Color::Red)
            .warn(Color::Yellow)
            .info(Color::White)
            .debug(Color::Green)
            .trace(Color::Blue);

        let stdout_output = fern::Dispatch::new()
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "{}{}[{}][{}] {}",
                    format_args!(
                        "\x1B[{}m",
                        colors_line.get_color(&record.level()).to_fg_str()
                    ),
                    chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .chain(std::io::stdout());

        let mut root = fern::Dispatch::new().level(level).chain(stdout_output);

        if let Some(mirror) = mirror {
            root = root.chain(
                fern::Dispatch::new().chain(fern::Output::call(move |record| {
                    mirror.push(format!(
                        "{}: {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.args()
                    ));
                })),
            );
        }

        let _ = root.apply();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SinkEngine;

    #[test]
    fn mirror_drains_in_order_and_caps() {
        let mirror = GatewayMirror::new();
        for i in 0..100 {
            mirror.push(format!("line {}", i));
        }

        let mut engine = SinkEngine::default();
        mirror.drain_into(&mut engine);
        assert_eq!(engine.log_lines().len(), 64);
        assert_eq!(engine.log_lines()[0], "line 36");
        assert_eq!(engine.log_lines()[63], "line 99");

        // drained: second pass adds nothing
        let mut engine2 = SinkEngine::default();
        mirror.drain_into(&mut engine2);
        assert!(engine2.log_lines().is_empty());
    }
}
