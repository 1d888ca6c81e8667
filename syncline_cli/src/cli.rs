use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "syncline", version, about = "Run sync jobs between connectors")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one sync job described by a JSON job file.
    ///
    /// Cursors are read from and written back to `--state-file`, so repeated
    /// invocations resume where the last one committed. Source settings
    /// refreshed during the run (rotated OAuth tokens) are written back to the
    /// job file.
    Sync {
        /// Path to the job file.
        #[arg(long)]
        job: PathBuf,

        /// Cursor file; created on first run.
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Ignore stored cursors and re-read everything.
        #[arg(long)]
        full: bool,

        /// Postgres URL, required when the destination connector is `postgres`.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,

        /// External OAuth token broker used to refresh expiring tokens.
        #[arg(long, env = "SYNCLINE_TOKEN_BROKER_URL")]
        token_broker_url: Option<String>,
    },

    /// List registered connectors and what each provides.
    Connectors,
}

/// One side of a job: a connector plus its config and connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub connector: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default = "empty_object")]
    pub settings: serde_json::Value,
    /// External account id, used as the connection's external id.
    #[serde(default)]
    pub external_id: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default = "default_true")]
    pub unify: bool,
    /// Postgres table for the `postgres` destination.
    #[serde(default)]
    pub table: Option<String>,
}

impl JobFile {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let job: JobFile = serde_json::from_str(raw)?;
        if job.source.connector.trim().is_empty() || job.destination.connector.trim().is_empty() {
            anyhow::bail!("job source and destination connectors must be set");
        }
        Ok(job)
    }
}

/// Rewrite a job file with new `source.settings`, keeping everything else.
pub fn with_source_settings(raw: &str, settings: serde_json::Value) -> anyhow::Result<String> {
    let mut job: serde_json::Value = serde_json::from_str(raw)?;
    let Some(source) = job.get_mut("source").and_then(serde_json::Value::as_object_mut) else {
        anyhow::bail!("job file has no source object");
    };
    source.insert("settings".to_string(), settings);
    Ok(serde_json::to_string_pretty(&job)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_command_parses() {
        let cli = Cli::try_parse_from([
            "syncline",
            "sync",
            "--job",
            "job.json",
            "--state-file",
            "state.json",
            "--full",
        ])
        .unwrap();
        match cli.command {
            Commands::Sync {
                job,
                state_file,
                full,
                ..
            } => {
                assert_eq!(job, PathBuf::from("job.json"));
                assert_eq!(state_file, Some(PathBuf::from("state.json")));
                assert!(full);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(Cli::try_parse_from(["syncline", "sync"]).is_err());
    }

    #[test]
    fn job_file_defaults() {
        let job = JobFile::parse(
            r#"{"source": {"connector": "hubspot", "settings": {"access_token": "t"}},
                "destination": {"connector": "memory"}}"#,
        )
        .unwrap();
        assert!(job.unify);
        assert!(job.streams.is_empty());
        assert_eq!(job.destination.config, serde_json::json!({}));
        assert!(JobFile::parse(r#"{"source": {"connector": ""}, "destination": {"connector": "memory"}}"#).is_err());
    }

    #[test]
    fn refreshed_settings_replace_only_the_source_settings() {
        let raw = r#"{
            "source": {"connector": "hubspot", "settings": {"access_token": "old"}},
            "destination": {"connector": "memory"},
            "streams": ["contact"]
        }"#;
        let updated =
            with_source_settings(raw, serde_json::json!({"access_token": "new"})).unwrap();
        let job = JobFile::parse(&updated).unwrap();
        assert_eq!(job.source.settings, serde_json::json!({"access_token": "new"}));
        assert_eq!(job.source.connector, "hubspot");
        assert_eq!(job.destination.connector, "memory");
        assert_eq!(job.streams, vec!["contact"]);

        assert!(with_source_settings("{}", serde_json::json!({})).is_err());
    }
}
