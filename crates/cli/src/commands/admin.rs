//! Store administration commands

use anyhow::Result;
use clap::Subcommand;
use meshconf_common::store::FieldOverrides;
use meshconf_common::NodeStore;
use serde::Serialize;

use crate::output::{print_list, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Seed the identifier counter of an empty store
    Init {
        /// First identifier handed out
        #[arg(long, default_value = "1")]
        start: u64,
    },

    /// Show which nodes override a default value
    ShowOverrides,
}

/// One row per default field
#[derive(Serialize)]
pub struct OverrideDisplay {
    pub field: String,
    pub default: String,
    pub inherited: u64,
    pub overridden_by: Vec<String>,
}

impl From<FieldOverrides> for OverrideDisplay {
    fn from(entry: FieldOverrides) -> Self {
        Self {
            field: entry.field,
            default: entry.default_value,
            inherited: entry.inherited,
            overridden_by: entry
                .overrides
                .into_iter()
                .map(|o| format!("{}={}", o.node, o.value))
                .collect(),
        }
    }
}

impl TableDisplay for OverrideDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Field", "Default", "Inherited", "Overridden By"]
    }

    fn row(&self) -> Vec<String> {
        let default = if self.default.len() > 40 {
            format!("{}...", self.default.chars().take(37).collect::<String>())
        } else {
            self.default.clone()
        };
        vec![
            self.field.clone(),
            default,
            self.inherited.to_string(),
            self.overridden_by.join("\n"),
        ]
    }
}

pub async fn execute(cmd: AdminCommands, store: NodeStore, format: OutputFormat) -> Result<()> {
    match cmd {
        AdminCommands::Init { start } => {
            if store.init_counter(start).await? {
                print_success(&format!(
                    "Initialized {} to {}",
                    store.options().counter_key,
                    start
                ));
            } else {
                let current = store.next_free_id().await?.unwrap_or(start);
                print_warning(&format!(
                    "{} already exists (next id {}), left unchanged",
                    store.options().counter_key,
                    current
                ));
            }
        }

        AdminCommands::ShowOverrides => {
            let report: Vec<OverrideDisplay> = store
                .override_report()
                .await?
                .into_iter()
                .map(OverrideDisplay::from)
                .collect();
            print_list(&report, format)?;
        }
    }

    Ok(())
}
