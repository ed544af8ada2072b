//! Job requests and records

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{ErrorKind, TtsError};
use crate::engine::{SynthesisMode, SynthesisOutput};

/// Client synthesis request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub text: String,
    pub engine_id: String,
    /// Engine baseline when unset
    #[serde(default)]
    pub quality_profile: Option<String>,
    /// Voice or reference identifier
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub mode: SynthesisMode,
}

impl JobRequest {
    pub fn new(text: impl Into<String>, engine_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            engine_id: engine_id.into(),
            quality_profile: None,
            voice: None,
            language: None,
            mode: SynthesisMode::Direct,
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.quality_profile = Some(profile.into());
        self
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Clone the given reference voice
    pub fn cloned(mut self, reference: impl Into<String>) -> Self {
        self.voice = Some(reference.into());
        self.mode = SynthesisMode::Cloned;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Error recorded on a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TtsError> for JobError {
    fn from(err: &TtsError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Produced audio, without the samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSummary {
    pub sample_rate: u32,
    pub duration_secs: f32,
    pub samples: usize,
}

impl From<&SynthesisOutput> for AudioSummary {
    fn from(output: &SynthesisOutput) -> Self {
        Self {
            sample_rate: output.sample_rate,
            duration_secs: output.duration,
            samples: output.audio.len(),
        }
    }
}

/// Persisted job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub requested_engine_id: String,
    /// Set once processing starts
    pub used_engine_id: Option<String>,
    pub requested_quality_profile_id: String,
    pub used_quality_profile_id: Option<String>,
    pub fallback: bool,
    pub fallback_reason: Option<String>,
    pub error: Option<JobError>,
    pub mode: SynthesisMode,
    pub voice: Option<String>,
    pub text_chars: usize,
    pub result_location: Option<PathBuf>,
    pub audio: Option<AudioSummary>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: &JobRequest, profile_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            requested_engine_id: request.engine_id.clone(),
            used_engine_id: None,
            requested_quality_profile_id: profile_id.into(),
            used_quality_profile_id: None,
            fallback: false,
            fallback_reason: None,
            error: None,
            mode: request.mode,
            voice: request.voice.clone(),
            text_chars: request.text.chars().count(),
            result_location: None,
            audio: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub(crate) fn start(&mut self) {
        debug_assert_eq!(self.status, JobStatus::Pending);
        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.used_engine_id = Some(self.requested_engine_id.clone());
        self.used_quality_profile_id = Some(self.requested_quality_profile_id.clone());
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn redirect(&mut self, engine_id: &str, profile_id: &str, reason: String) {
        debug_assert_eq!(self.status, JobStatus::Processing);
        self.used_engine_id = Some(engine_id.to_string());
        self.used_quality_profile_id = Some(profile_id.to_string());
        self.fallback = true;
        self.fallback_reason = Some(reason);
        self.updated_at = Utc::now();
    }

    pub(crate) fn complete(&mut self, audio: AudioSummary, location: Option<PathBuf>) {
        debug_assert!(!self.status.is_terminal());
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.audio = Some(audio);
        self.result_location = location;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn fail(&mut self, err: &TtsError) {
        debug_assert!(!self.status.is_terminal());
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(err.into());
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// `used == requested` exactly when no fallback happened
    pub fn provenance_consistent(&self) -> bool {
        match &self.used_engine_id {
            Some(used) => (used == &self.requested_engine_id) != self.fallback,
            None => !self.fallback,
        }
    }
}
