//! A global store of flags that can impact lifting.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different lifting runs in the same process).

use std::sync::Mutex;

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
#[derive(Debug)]
pub struct LiftConfig {
    /// In debug builds, compare a temporary's declared type against the width the foreign node
    /// reports for it, and log any disagreement. The declared type is used either way.
    pub warn_on_temp_width_mismatch: bool,
    /// Attach the disassembly text of each block to its address label.
    pub attach_disassembly_to_block_labels: bool,
    /// Prefix lifted programs with stores that initialize read-only data.
    pub materialize_read_only_data: bool,
}

impl LiftConfig {
    /// Internal method: sets up initialization
    fn from_initialized() -> Self {
        let init = INTERNAL_CONFIG_INITIALIZER
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default();
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`, before anything reads [`CONFIG`](static@CONFIG).
    pub fn initialize(command_line_config: Vec<CommandLineLiftConfig>) {
        let prev = INTERNAL_CONFIG_INITIALIZER
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Some(command_line_config.into()));
        assert!(
            matches!(prev, Some(None)),
            "Performed double initialization, or initialized after first use"
        );
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail. `Some(None)` until `initialize` provides a configuration, and
/// `None` once [`CONFIG`](static@CONFIG) has consumed it.
static INTERNAL_CONFIG_INITIALIZER: Mutex<Option<Option<LiftConfig>>> = Mutex::new(Some(None));

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: LiftConfig = LiftConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Lifting configuration parameters
pub enum CommandLineLiftConfig {
    EnableTempWidthCheck,
    DisableDisassemblyAttributes,
    DisableReadOnlyDataMaterialization,
}

impl Default for LiftConfig {
    fn default() -> Self {
        LiftConfig {
            warn_on_temp_width_mismatch: false,
            attach_disassembly_to_block_labels: true,
            materialize_read_only_data: true,
        }
    }
}

impl From<Vec<CommandLineLiftConfig>> for LiftConfig {
    fn from(v: Vec<CommandLineLiftConfig>) -> Self {
        use CommandLineLiftConfig::*;
        let mut r = LiftConfig::default();
        for v in v {
            match v {
                EnableTempWidthCheck => {
                    r.warn_on_temp_width_mismatch = true;
                }
                DisableDisassemblyAttributes => {
                    r.attach_disassembly_to_block_labels = false;
                }
                DisableReadOnlyDataMaterialization => {
                    r.materialize_read_only_data = false;
                }
            }
        }
        r
    }
}
