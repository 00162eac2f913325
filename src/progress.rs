//! Progress reporting.
//!
//! The core never prints. It emits [`ProgressEvent`]s to a [`ProgressSink`];
//! the binary installs a [`ConsoleSink`] that renders right-aligned status
//! lines, tests install a mock or a [`RecordingSink`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Upgrade,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Install => write!(f, "install"),
            Action::Upgrade => write!(f, "upgrade"),
            Action::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Resolving {
        name: String,
    },
    Started {
        action: Action,
        name: String,
        version: String,
    },
    Finished {
        action: Action,
        name: String,
        version: String,
        path: PathBuf,
    },
    Failed {
        name: String,
        path: PathBuf,
        cause: String,
    },
    Warning(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Prints status lines to stdout and warnings to stderr.
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Resolving { name } => println!("   resolving {}", name),
            ProgressEvent::Started {
                action: Action::Remove,
                name,
                version,
            } => println!("    removing {} {}", name, version),
            ProgressEvent::Started {
                action,
                name,
                version,
            } => println!(" downloading {} {} ({})", name, version, action),
            ProgressEvent::Finished {
                action: Action::Remove,
                name,
                path,
                ..
            } => println!("     removed {} {}", name, path.display()),
            ProgressEvent::Finished {
                action: Action::Upgrade,
                name,
                version,
                path,
            } => println!("    upgraded {} {} {}", name, version, path.display()),
            ProgressEvent::Finished {
                name,
                version,
                path,
                ..
            } => println!("   installed {} {} {}", name, version, path.display()),
            ProgressEvent::Failed { name, path, cause } => {
                eprintln!("      failed {} {}: {}", name, path.display(), cause)
            }
            ProgressEvent::Warning(message) => eprintln!("     warning {}", message),
        }
    }
}

/// Discards every event.
pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Keeps every event in order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names from `Finished` events, in emission order.
    pub fn finished(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Finished { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Warning(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.emit(ProgressEvent::Finished {
            action: Action::Install,
            name: "child".into(),
            version: "1.0.0".into(),
            path: PathBuf::from("modules/parent/modules/child"),
        });
        sink.emit(ProgressEvent::Warning("engine mismatch".into()));
        sink.emit(ProgressEvent::Finished {
            action: Action::Install,
            name: "parent".into(),
            version: "1.0.0".into(),
            path: PathBuf::from("modules/parent"),
        });

        assert_eq!(sink.finished(), vec!["child", "parent"]);
        assert_eq!(sink.warnings(), vec!["engine mismatch"]);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_mock_sink_receives_events() {
        let mut sink = MockProgressSink::new();
        sink.expect_emit()
            .withf(|e| matches!(e, ProgressEvent::Resolving { name } if name == "foo"))
            .times(1)
            .return_const(());
        sink.emit(ProgressEvent::Resolving { name: "foo".into() });
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::Upgrade.to_string(), "upgrade");
    }
}
