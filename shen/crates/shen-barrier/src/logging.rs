//! Barrier Emission Logging
//!
//! Records what the barrier set did for each site, useful for:
//! - Auditing generated code size per barrier kind
//! - Debugging aborted compilations
//!
//! Log Levels:
//! - ERROR: Aborted emissions
//! - INFO: Configuration changes
//! - DEBUG: Emitted sites
//! - TRACE: Elided sites

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::stats::BarrierKind;

/// Log level for barrier events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Barrier event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BarrierEvent {
    /// Barrier code emitted for a site
    Emitted {
        kind: BarrierKind,
        isa: &'static str,
        detail: String,
        instructions: usize,
        out_of_line_blocks: usize,
    },

    /// Site needed no code
    Elided { kind: BarrierKind, isa: &'static str },

    /// Emission refused; the method must not be installed
    Aborted {
        kind: BarrierKind,
        isa: &'static str,
        error: String,
    },

    /// Barrier set created or reconfigured
    Configured {
        verify_oops: bool,
        slow_path_only: bool,
        compressed_oops: bool,
        generational: bool,
    },
}

/// Barrier logger configuration
#[derive(Debug, Clone)]
pub struct BarrierLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Forward events to the `log` facade
    pub forward: bool,

    /// Forward as JSON instead of human-readable text
    pub json: bool,

    /// Maximum number of retained events, oldest dropped first
    pub capacity: usize,
}

impl Default for BarrierLoggerConfig {
    fn default() -> Self {
        Self { level: LogLevel::Debug, forward: true, json: false, capacity: 4096 }
    }
}

/// Barrier logger - centralized record of emission events
pub struct BarrierLogger {
    config: BarrierLoggerConfig,
    events: Mutex<Vec<(Instant, BarrierEvent)>>,
    enabled: AtomicBool,
}

impl BarrierLogger {
    pub fn new(config: BarrierLoggerConfig) -> Self {
        Self { config, events: Mutex::new(Vec::new()), enabled: AtomicBool::new(true) }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BarrierLoggerConfig {
        &self.config
    }

    /// Log a barrier event
    pub fn log(&self, event: BarrierEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = Self::event_level(&event);
        if level > self.config.level {
            return;
        }

        if self.config.forward {
            self.forward(level, &event);
        }

        let mut events = self.events.lock();
        if self.config.capacity > 0 && events.len() >= self.config.capacity {
            events.remove(0);
        }
        events.push((Instant::now(), event));
    }

    fn event_level(event: &BarrierEvent) -> LogLevel {
        match event {
            BarrierEvent::Aborted { .. } => LogLevel::Error,
            BarrierEvent::Configured { .. } => LogLevel::Info,
            BarrierEvent::Emitted { .. } => LogLevel::Debug,
            BarrierEvent::Elided { .. } => LogLevel::Trace,
        }
    }

    fn forward(&self, level: LogLevel, event: &BarrierEvent) {
        let message = if self.config.json {
            match serde_json::to_string(event) {
                Ok(json) => json,
                Err(_) => return,
            }
        } else {
            Self::format_human(event)
        };

        match level {
            LogLevel::Error => log::error!("{}", message),
            LogLevel::Warn => log::warn!("{}", message),
            LogLevel::Info => log::info!("{}", message),
            LogLevel::Debug => log::debug!("{}", message),
            LogLevel::Trace => log::trace!("{}", message),
        }
    }

    /// Human-readable form of an event
    pub fn format_human(event: &BarrierEvent) -> String {
        match event {
            BarrierEvent::Emitted { kind, isa, detail, instructions, out_of_line_blocks } => {
                format!(
                    "[barrier] {} {} ({}): {} instructions, {} out-of-line blocks",
                    isa, kind, detail, instructions, out_of_line_blocks
                )
            },
            BarrierEvent::Elided { kind, isa } => {
                format!("[barrier] {} {} elided", isa, kind)
            },
            BarrierEvent::Aborted { kind, isa, error } => {
                format!("[barrier] {} {} aborted: {}", isa, kind, error)
            },
            BarrierEvent::Configured { verify_oops, slow_path_only, compressed_oops, generational } => {
                format!(
                    "[barrier] configured: verify_oops={}, slow_path_only={}, compressed_oops={}, generational={}",
                    verify_oops, slow_path_only, compressed_oops, generational
                )
            },
        }
    }

    pub fn events(&self) -> Vec<BarrierEvent> {
        self.events.lock().iter().map(|(_, event)| event.clone()).collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for BarrierLogger {
    fn default() -> Self {
        Self::new(BarrierLoggerConfig::default())
    }
}

impl std::fmt::Debug for BarrierLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierLogger")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .field("events", &self.event_count())
            .finish()
    }
}
