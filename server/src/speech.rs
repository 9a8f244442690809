use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Client for the external speech-synthesis service. Jobs are detached
/// from the request path: the HTTP reply is already decided when a job is
/// submitted, and every failure ends in the log, never in a response.
#[derive(Clone)]
pub struct SpeechSynthesizer {
    http: Client,
    endpoint: Arc<String>,
    audio_dir: Arc<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum SpeechError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("api failure ({0}): {1}")]
    ApiFailure(StatusCode, String),
    #[error("failed to write audio artifact: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
}

impl SpeechSynthesizer {
    pub fn new(http: Client, endpoint: String, audio_dir: PathBuf) -> Self {
        Self {
            http,
            endpoint: Arc::new(endpoint),
            audio_dir: Arc::new(audio_dir),
        }
    }

    /// Spawns a background synthesis job for the final reply text. The
    /// artifact path is logged at submission so it can be located later.
    pub fn submit(&self, reply: String) {
        let synthesizer = self.clone();
        let job = Uuid::new_v4();
        let path = synthesizer.audio_path(job);
        info!(
            target: "speech",
            %job,
            path = %path.display(),
            chars = reply.len(),
            msg = "speech synthesis job submitted"
        );
        tokio::spawn(async move {
            match synthesizer.render(&reply, &path).await {
                Ok(bytes) => {
                    info!(target: "speech", %job, bytes, msg = "speech synthesis job finished");
                }
                Err(err) => {
                    error!(target: "speech", %job, error = %err, msg = "speech synthesis job failed");
                }
            }
        });
    }

    fn audio_path(&self, job: Uuid) -> PathBuf {
        self.audio_dir.join(format!("{job}.mp3"))
    }

    async fn render(&self, text: &str, path: &Path) -> Result<usize, SpeechError> {
        let payload = SynthesisRequest { text };
        let response = self
            .http
            .post(self.endpoint.as_str())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SpeechError::ApiFailure(status, detail));
        }

        let audio = response.bytes().await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &audio).await?;
        Ok(audio.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_path_is_derivable_from_job_id() {
        let synthesizer = SpeechSynthesizer::new(
            Client::new(),
            "http://localhost:9000/synthesize".to_string(),
            PathBuf::from("audio"),
        );
        let job = Uuid::new_v4();
        let path = synthesizer.audio_path(job);
        assert_eq!(path, PathBuf::from("audio").join(format!("{job}.mp3")));
    }

    #[test]
    fn synthesis_request_carries_reply_text() {
        let payload = SynthesisRequest {
            text: "hi there",
        };
        let value = serde_json::to_value(&payload).expect("serializes");
        assert_eq!(value, serde_json::json!({ "text": "hi there" }));
    }
}
