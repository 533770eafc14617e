//! Backends command: print the configured backends without connecting.

use color_eyre::Result;
use serde_json::json;

use super::App;

impl App {
    pub fn run_backends(&self, as_json: bool) -> Result<()> {
        let config = self.load_config()?;
        config.validate()?;

        let descriptors: Vec<_> = config.backends.iter().map(|b| b.descriptor()).collect();

        if as_json {
            let list: Vec<_> = descriptors
                .iter()
                .map(|d| {
                    json!({
                        "id": d.id,
                        "kind": d.kind,
                        "connect": d.connect.redacted(),
                        "max_concurrency": d.max_concurrency,
                        "connection_limit": d.connection_limit,
                        "admission_policy": d.admission.policy,
                        "access": d.access,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
            return Ok(());
        }

        if descriptors.is_empty() {
            println!("No backends configured");
            return Ok(());
        }

        println!(
            "{:<16} {:<9} {:>5} {:>5}  {:<6} {:<5}  CONNECT",
            "ID", "KIND", "CONC", "CONN", "POLICY", "RW"
        );
        for d in &descriptors {
            let rw = format!(
                "{}{}",
                if d.access.read { "r" } else { "-" },
                if d.access.write { "w" } else { "-" }
            );
            let policy = serde_json::to_value(d.admission.policy)?;
            println!(
                "{:<16} {:<9} {:>5} {:>5}  {:<6} {:<5}  {}",
                d.id,
                d.kind.as_str(),
                d.max_concurrency,
                d.connection_limit,
                policy.as_str().unwrap_or_default(),
                rw,
                d.connect.redacted()
            );
        }
        Ok(())
    }
}
