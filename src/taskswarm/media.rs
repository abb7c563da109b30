//! Media generation: images synchronously, video and speech as async jobs.
//!
//! The four generator roles (`text_to_image`, `text_to_video`,
//! `image_to_video`, `voice_synthesizer`) drive this module through the
//! [`MediaGenerationClient`] trait. Image generation returns URLs in one
//! round-trip; video generation is submitted as an asynchronous provider job
//! that returns a task id and is then polled with
//! [`MediaGenerationClient::poll_media_task`] (or the [`await_media_task`]
//! convenience loop).

use async_trait::async_trait;
use std::error::Error;
use std::time::Duration;

use crate::taskswarm::clients::dashscope::DashScopeClient;
use crate::taskswarm::clients::retry::with_retries;

/// Options shared by the media generation operations.
///
/// All fields are optional; providers fall back to their own defaults.
#[derive(Debug, Clone, Default)]
pub struct MediaGenerationOptions {
    /// Aspect ratio such as `"16:9"` (images and video).
    pub aspect_ratio: Option<String>,
    /// Number of outputs to generate (images only, typically 1-4).
    pub num_outputs: Option<u32>,
    /// Output resolution such as `"1080p"` (video only).
    pub resolution: Option<String>,
    /// Voice identifier (speech only).
    pub voice: Option<String>,
}

/// Status of an asynchronous media job.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaTaskStatus {
    /// Queued on the provider side.
    Pending,
    /// Generation in progress.
    Running,
    /// Finished; artifact URLs are ready.
    Succeeded {
        /// URLs of the produced artifacts.
        urls: Vec<String>,
    },
    /// The job failed on the provider side.
    Failed {
        /// Provider-reported failure message.
        message: String,
    },
}

/// Uniform async-submit/poll surface over the provider's media APIs.
#[async_trait]
pub trait MediaGenerationClient: Send + Sync {
    /// Generate one or more images; returns artifact URLs synchronously.
    async fn text_to_image(
        &self,
        prompt: &str,
        options: &MediaGenerationOptions,
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>>;

    /// Submit a text-to-video job; returns the provider task id.
    async fn text_to_video(
        &self,
        prompt: &str,
        options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Submit an image-to-video job; returns the provider task id.
    async fn image_to_video(
        &self,
        image_url: &str,
        prompt: &str,
        options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Poll an asynchronous media job.
    async fn poll_media_task(
        &self,
        task_id: &str,
    ) -> Result<MediaTaskStatus, Box<dyn Error + Send + Sync>>;

    /// Synthesise speech; returns the audio artifact URL.
    async fn text_to_speech(
        &self,
        text: &str,
        options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Poll an async media job until it finishes or `timeout` elapses.
pub async fn await_media_task(
    client: &dyn MediaGenerationClient,
    task_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
    let started = tokio::time::Instant::now();
    loop {
        match client.poll_media_task(task_id).await? {
            MediaTaskStatus::Succeeded { urls } => return Ok(urls),
            MediaTaskStatus::Failed { message } => {
                return Err(format!("media task {} failed: {}", task_id, message).into());
            }
            MediaTaskStatus::Pending | MediaTaskStatus::Running => {
                if started.elapsed() >= timeout {
                    return Err(format!(
                        "media task {} did not finish within {:?}",
                        task_id, timeout
                    )
                    .into());
                }
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

// Provider endpoints, relative to the DashScope API root (not the
// compatible-mode root used for chat).
const DASHSCOPE_API_ROOT: &str = "https://dashscope.aliyuncs.com/api/v1";
const IMAGE_SYNTHESIS_PATH: &str = "/services/aigc/text2image/image-synthesis";
const VIDEO_SYNTHESIS_PATH: &str = "/services/aigc/video-generation/video-synthesis";
const SPEECH_SYNTHESIS_PATH: &str = "/services/aigc/multimodal-generation/generation";
const TASKS_PATH: &str = "/tasks";

const IMAGE_MODEL: &str = "wan2.2-t2i-flash";
const TEXT_TO_VIDEO_MODEL: &str = "wan2.2-t2v-plus";
const IMAGE_TO_VIDEO_MODEL: &str = "wan2.2-i2v-flash";
const SPEECH_MODEL: &str = "qwen3-tts-flash";

async fn post_media_request(
    client: &DashScopeClient,
    path: &str,
    body: serde_json::Value,
    async_job: bool,
) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
    let url = format!("{}{}", DASHSCOPE_API_ROOT, path);
    let mut request = client
        .http()
        .post(&url)
        .header("Authorization", format!("Bearer {}", client.api_key()))
        .header("Content-Type", "application/json");
    if async_job {
        request = request.header("X-DashScope-Async", "enable");
    }
    let resp = request
        .json(&body)
        .send()
        .await
        .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;
    if !status.is_success() {
        return Err(format!("media request failed: HTTP {} — {}", status, text).into());
    }
    serde_json::from_str(&text).map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })
}

fn collect_result_urls(output: &serde_json::Value) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(results) = output.get("results").and_then(|r| r.as_array()) {
        for item in results {
            if let Some(url) = item.get("url").and_then(|u| u.as_str()) {
                urls.push(url.to_string());
            }
        }
    }
    if let Some(url) = output.get("video_url").and_then(|u| u.as_str()) {
        urls.push(url.to_string());
    }
    urls
}

#[async_trait]
impl MediaGenerationClient for DashScopeClient {
    async fn text_to_image(
        &self,
        prompt: &str,
        options: &MediaGenerationOptions,
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        let size = match options.aspect_ratio.as_deref() {
            Some("16:9") => "1344*756",
            Some("9:16") => "756*1344",
            _ => "1024*1024",
        };
        let body = serde_json::json!({
            "model": IMAGE_MODEL,
            "input": { "prompt": prompt },
            "parameters": {
                "size": size,
                "n": options.num_outputs.unwrap_or(1),
            }
        });
        let parsed = with_retries(3, |_attempt| {
            post_media_request(self, IMAGE_SYNTHESIS_PATH, body.clone(), false)
        })
        .await?;

        let urls = parsed
            .get("output")
            .map(collect_result_urls)
            .unwrap_or_default();
        if urls.is_empty() {
            return Err("image synthesis returned no artifact URLs".into());
        }
        Ok(urls)
    }

    async fn text_to_video(
        &self,
        prompt: &str,
        options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let body = serde_json::json!({
            "model": TEXT_TO_VIDEO_MODEL,
            "input": { "prompt": prompt },
            "parameters": {
                "resolution": options.resolution.clone().unwrap_or_else(|| "1080p".to_string()),
            }
        });
        let parsed = with_retries(3, |_attempt| {
            post_media_request(self, VIDEO_SYNTHESIS_PATH, body.clone(), true)
        })
        .await?;
        parsed
            .get("output")
            .and_then(|o| o.get("task_id"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "video synthesis submission returned no task id".into())
    }

    async fn image_to_video(
        &self,
        image_url: &str,
        prompt: &str,
        options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let body = serde_json::json!({
            "model": IMAGE_TO_VIDEO_MODEL,
            "input": {
                "prompt": prompt,
                "img_url": image_url,
            },
            "parameters": {
                "resolution": options.resolution.clone().unwrap_or_else(|| "720p".to_string()),
            }
        });
        let parsed = with_retries(3, |_attempt| {
            post_media_request(self, VIDEO_SYNTHESIS_PATH, body.clone(), true)
        })
        .await?;
        parsed
            .get("output")
            .and_then(|o| o.get("task_id"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "image-to-video submission returned no task id".into())
    }

    async fn poll_media_task(
        &self,
        task_id: &str,
    ) -> Result<MediaTaskStatus, Box<dyn Error + Send + Sync>> {
        let url = format!("{}{}/{}", DASHSCOPE_API_ROOT, TASKS_PATH, task_id);
        let resp = self
            .http()
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key()))
            .send()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;
        if !status.is_success() {
            return Err(format!("task poll failed: HTTP {} — {}", status, text).into());
        }
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

        let output = parsed.get("output").cloned().unwrap_or_default();
        let task_status = output
            .get("task_status")
            .and_then(|s| s.as_str())
            .unwrap_or("UNKNOWN");
        match task_status {
            "PENDING" => Ok(MediaTaskStatus::Pending),
            "RUNNING" => Ok(MediaTaskStatus::Running),
            "SUCCEEDED" => Ok(MediaTaskStatus::Succeeded {
                urls: collect_result_urls(&output),
            }),
            other => Ok(MediaTaskStatus::Failed {
                message: output
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or(other)
                    .to_string(),
            }),
        }
    }

    async fn text_to_speech(
        &self,
        text: &str,
        options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let body = serde_json::json!({
            "model": SPEECH_MODEL,
            "input": {
                "text": text,
                "voice": options.voice.clone().unwrap_or_else(|| "Cherry".to_string()),
            }
        });
        let parsed = with_retries(3, |_attempt| {
            post_media_request(self, SPEECH_SYNTHESIS_PATH, body.clone(), false)
        })
        .await?;
        parsed
            .get("output")
            .and_then(|o| o.get("audio"))
            .and_then(|a| a.get("url"))
            .and_then(|u| u.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "speech synthesis returned no audio URL".into())
    }
}
