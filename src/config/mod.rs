// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for DeepTrack

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Recognition service configuration
    pub ai_engine: EngineConfig,

    /// Prompt templates
    #[serde(default)]
    pub prompts: PromptConfig,

    /// Background job execution
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Uploaded blob storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// HTTP server settings
    #[serde(default)]
    pub web: WebConfig,
}

/// Wire protocol spoken by the recognition service
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI-compatible `/chat/completions`
    OpenAi,
    /// Ollama `/api/generate`
    Ollama,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_provider")]
    pub provider: Provider,
    pub url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Longest side in pixels before an image is downscaled for upload
    #[serde(default = "default_max_dimension")]
    pub max_image_dimension: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_system_prompt")]
    pub system: String,
    #[serde(default = "default_detection_prompt")]
    pub detection: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JobsConfig {
    /// Jobs allowed to run at the same time
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs that may wait in the queue before `create_job` applies backpressure
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Directory holding the database file, or `:memory:`
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_db_name")]
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_provider() -> Provider { Provider::OpenAi }
fn default_timeout() -> u64 { 120 }
fn default_max_dimension() -> u32 { 2048 }
fn default_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 256 }
fn default_upload_dir() -> String { "uploads".to_string() }
fn default_db_url() -> String { ".".to_string() }
fn default_db_name() -> String { "deeptrack".to_string() }
fn default_web_host() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8001 }
fn default_cors_origins() -> Vec<String> { vec!["*".to_string()] }
fn default_max_upload() -> usize { 64 * 1024 * 1024 }

fn default_system_prompt() -> String {
    "You are an expert in multispectral image analysis and target recognition. \
     Analyze images for objects like vehicles, people, buildings, and other targets. \
     Provide detailed detection results with confidence scores and bounding box coordinates."
        .to_string()
}

fn default_detection_prompt() -> String {
    r#"Analyze this multispectral image for target detection. Identify and locate:
1. Vehicles (cars, trucks, aircraft)
2. People/Personnel
3. Buildings/Structures
4. Other significant objects

For each detected target, provide:
- Target type
- Confidence score (0-1)
- Bounding box coordinates (x, y, width, height as fractions of image dimensions)
- Brief description

Format response as JSON array:
[{"type": "vehicle", "confidence": 0.95, "bbox": {"x": 0.2, "y": 0.3, "width": 0.1, "height": 0.15}, "description": "Red car"}]"#
        .to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ai_engine: EngineConfig {
                provider: default_provider(),
                url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o".to_string(),
                api_key: None,
                timeout_secs: default_timeout(),
                max_image_dimension: default_max_dimension(),
            },
            prompts: PromptConfig::default(),
            jobs: JobsConfig::default(),
            storage: StorageConfig::default(),
            database: DatabaseConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: default_system_prompt(),
            detection: default_detection_prompt(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            name: default_db_name(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
            cors_origins: default_cors_origins(),
            max_upload_bytes: default_max_upload(),
        }
    }
}

impl DatabaseConfig {
    /// Whether the store lives only in memory
    pub fn is_in_memory(&self) -> bool {
        self.url == ":memory:"
    }

    /// Resolved path of the database file
    pub fn file_path(&self) -> PathBuf {
        Path::new(&self.url).join(format!("{}.db", self.name))
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::DeepTrackError::Config(format!("Failed to parse config: {}", e)))?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Load configuration and apply environment overrides
    pub fn load_with_env(path: &Path) -> crate::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(name) = lookup("DB_NAME") {
            self.database.name = name;
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            self.web.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(key) = lookup("LLM_API_KEY") {
            self.ai_engine.api_key = Some(key);
        }
        if let Some(url) = lookup("LLM_BASE_URL") {
            self.ai_engine.url = url;
        }
        if let Some(dir) = lookup("UPLOAD_DIR") {
            self.storage.upload_dir = dir;
        }
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.jobs.workers == 0 {
            return Err(crate::DeepTrackError::Config("jobs.workers must be at least 1".to_string()));
        }
        if self.jobs.queue_capacity == 0 {
            return Err(crate::DeepTrackError::Config(
                "jobs.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.database.name.trim().is_empty() {
            return Err(crate::DeepTrackError::Config("database.name is empty".to_string()));
        }
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
