use std::fmt::{self, Write};

use indenter::indented;
use resources::{config::BatchQueue, objects::TemplateConfig};

use crate::app::App;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    pub name: String,
    /// Description of the built template, or the reason the entry failed.
    pub result: Result<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub outcomes: Vec<EntryOutcome>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Batch finished: {} succeeded, {} failed",
            self.succeeded(),
            self.failed()
        )?;
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(built) => writeln!(indented(f), "{:<8} {}", "OK", built)?,
                Err(reason) => {
                    writeln!(indented(f), "{:<8} {}: {}", "FAILED", outcome.name, reason)?
                },
            }
        }
        Ok(())
    }
}

/// Build every entry of `queue` on top of `base`, one after another.
///
/// A failing entry is recorded and the queue moves on.
pub async fn run(app: &App, queue: &BatchQueue, base: &TemplateConfig) -> BatchSummary {
    let mut summary = BatchSummary::default();
    let resolved = queue.resolve(base);
    let total = resolved.len();
    for (index, (name, config)) in resolved.into_iter().enumerate() {
        tracing::info!("Processing batch entry {}/{}: {}...", index + 1, total, name);
        let result = match config {
            Ok(config) => app.create(&config).await.map(|created| created.template.to_string()),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            tracing::error!("Batch entry {} failed: {:#}", name, err);
        }
        summary.outcomes.push(EntryOutcome {
            name,
            result: result.map_err(|err| format!("{:#}", err)),
        });
    }
    summary
}
