use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vidgen_comfyui::client::EngineAddress;
use vidgen_comfyui::reconnect::RetryPolicy;

/// How a resolved artifact is handed back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// Copy into the shared output directory; respond with `video_path`.
    #[default]
    Copy,
    /// Respond with the engine's own path as `file_path`.
    Path,
    /// Respond with the file inlined as a data URI under `video`.
    Base64,
}

impl PublishMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Path => "path",
            Self::Base64 => "base64",
        }
    }
}

impl FromStr for PublishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "path" => Ok(Self::Path),
            "base64" => Ok(Self::Base64),
            other => Err(format!("unknown publish mode '{other}'")),
        }
    }
}

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults matching the serverless container layout.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Engine host and port.
    pub engine: EngineAddress,
    /// Directory holding the graph template files.
    pub template_dir: PathBuf,
    /// The engine's own output directory, for file-name-only results.
    pub engine_output_dir: PathBuf,
    /// Shared volume that [`PublishMode::Copy`] writes into.
    pub output_dir: PathBuf,
    pub publish_mode: PublishMode,
    /// Where downloaded or decoded input images are written.
    pub scratch_dir: PathBuf,
    /// How long to wait for the terminal event of a submission.
    pub completion_timeout: Duration,
    pub connect_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine: EngineAddress {
                host: "127.0.0.1".into(),
                port: 8188,
            },
            template_dir: PathBuf::from("workflows"),
            engine_output_dir: PathBuf::from("/ComfyUI/output"),
            output_dir: PathBuf::from("/runpod-volume/output"),
            publish_mode: PublishMode::Copy,
            scratch_dir: std::env::temp_dir(),
            completion_timeout: Duration::from_secs(1800),
            connect_retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                  |
    /// |---------------------------|--------------------------|
    /// | `SERVER_ADDRESS`          | `127.0.0.1`              |
    /// | `SERVER_PORT`             | `8188`                   |
    /// | `TEMPLATE_DIR`            | `workflows`              |
    /// | `COMFY_OUTPUT_DIR`        | `/ComfyUI/output`        |
    /// | `OUTPUT_DIR`              | `/runpod-volume/output`  |
    /// | `PUBLISH_MODE`            | `copy`                   |
    /// | `SCRATCH_DIR`             | system temp dir          |
    /// | `COMPLETION_TIMEOUT_SECS` | `1800`                   |
    /// | `CONNECT_ATTEMPTS`        | `180`                    |
    /// | `CONNECT_DELAY_MS`        | `1000`                   |
    ///
    /// Unparsable values log a warning and keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let host = lookup("SERVER_ADDRESS")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.engine.host);
        let port = parsed(&lookup, "SERVER_PORT", defaults.engine.port);

        let path_or = |key: &str, default: PathBuf| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(default)
        };

        let timeout_secs = parsed(
            &lookup,
            "COMPLETION_TIMEOUT_SECS",
            defaults.completion_timeout.as_secs(),
        );
        let attempts = parsed(&lookup, "CONNECT_ATTEMPTS", defaults.connect_retry.attempts);
        let delay_ms = parsed(
            &lookup,
            "CONNECT_DELAY_MS",
            defaults.connect_retry.delay.as_millis() as u64,
        );

        Self {
            engine: EngineAddress { host, port },
            template_dir: path_or("TEMPLATE_DIR", defaults.template_dir),
            engine_output_dir: path_or("COMFY_OUTPUT_DIR", defaults.engine_output_dir),
            output_dir: path_or("OUTPUT_DIR", defaults.output_dir),
            publish_mode: parsed(&lookup, "PUBLISH_MODE", defaults.publish_mode),
            scratch_dir: path_or("SCRATCH_DIR", defaults.scratch_dir),
            completion_timeout: Duration::from_secs(timeout_secs),
            connect_retry: RetryPolicy {
                attempts,
                delay: Duration::from_millis(delay_ms),
            },
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid config value");
            default
        }
    }
}
