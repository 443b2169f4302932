//! Configuration for isolates, contexts, evaluations and engine flags.

use crate::runtime::error::BridgeError;
use crate::runtime::isolate::Isolate;
use crate::runtime::snapshot::Snapshot;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A single process-wide engine flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFlag {
    /// `--name` or `--no-name`
    Switch { name: String, enabled: bool },
    /// `--name=value`
    Value { name: String, value: String },
}

impl EngineFlag {
    pub fn switch(name: impl Into<String>, enabled: bool) -> Self {
        EngineFlag::Switch {
            name: name.into(),
            enabled,
        }
    }

    pub fn value(name: impl Into<String>, value: impl ToString) -> Self {
        EngineFlag::Value {
            name: name.into(),
            value: value.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EngineFlag::Switch { name, .. } | EngineFlag::Value { name, .. } => name,
        }
    }

    /// Reject names or values the engine's flag parser would misread.
    pub(crate) fn validate(&self) -> Result<(), BridgeError> {
        let name = self.name();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(BridgeError::Configuration(format!(
                "Malformed engine flag name '{}'",
                name
            )));
        }
        if let EngineFlag::Value { value, .. } = self {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(BridgeError::Configuration(format!(
                    "Malformed value '{}' for engine flag '{}'",
                    value, name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for EngineFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFlag::Switch {
                name,
                enabled: true,
            } => write!(f, "--{}", name),
            EngineFlag::Switch {
                name,
                enabled: false,
            } => write!(f, "--no-{}", name),
            EngineFlag::Value { name, value } => write!(f, "--{}={}", name, value),
        }
    }
}

impl FromStr for EngineFlag {
    type Err = BridgeError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let bare = token.trim_start_matches('-');
        if bare.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(BridgeError::Configuration(format!(
                "Malformed engine flag '{}'",
                token
            )));
        }

        let flag = match bare.split_once('=') {
            Some((name, value)) => EngineFlag::value(name, value),
            None => match bare.strip_prefix("no-") {
                Some(name) => EngineFlag::switch(name, false),
                None => EngineFlag::switch(bare, true),
            },
        };
        flag.validate()?;
        Ok(flag)
    }
}

/// Configuration for a single engine isolate.
#[derive(Debug, Clone, Default)]
pub struct IsolateConfig {
    /// Snapshot used to seed the heap
    pub snapshot: Option<Snapshot>,

    /// Maximum heap size in bytes (None = engine default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = engine default)
    pub initial_heap_size: Option<usize>,
}

impl IsolateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BridgeError> {
        match (self.initial_heap_size, self.max_heap_size) {
            (Some(_), None) => Err(BridgeError::Configuration(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            )),
            (Some(initial), Some(max)) if initial > max => {
                Err(BridgeError::Configuration(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Configuration for a context.
#[derive(Clone, Default)]
pub struct ContextConfig {
    /// Isolate to share; a private one is created when absent
    pub isolate: Option<Isolate>,

    /// Used to build the private isolate when `isolate` is absent
    pub isolate_config: IsolateConfig,

    /// Timeout applied to evaluations that do not set their own
    pub default_timeout: Option<Duration>,

    /// Used-heap ceiling applied to evaluations that do not set their own
    pub max_memory: Option<usize>,
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolate(mut self, isolate: Isolate) -> Self {
        self.isolate = Some(isolate);
        self
    }

    pub fn with_isolate_config(mut self, config: IsolateConfig) -> Self {
        self.isolate_config = config;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("shared_isolate", &self.isolate.is_some())
            .field("isolate_config", &self.isolate_config)
            .field("default_timeout", &self.default_timeout)
            .field("max_memory", &self.max_memory)
            .finish()
    }
}

/// Per-call evaluation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalOptions {
    pub timeout: Option<Duration>,
    pub max_memory: Option<usize>,
}

impl EvalOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, millis: u64) -> Self {
        self.with_timeout(Duration::from_millis(millis))
    }

    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Fill unset fields from context defaults.
    pub(crate) fn or_defaults(self, config: &ContextConfig) -> Self {
        Self {
            timeout: self.timeout.or(config.default_timeout),
            max_memory: self.max_memory.or(config.max_memory),
        }
    }
}
