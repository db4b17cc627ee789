use crate::error::{ChapterError, JobError};
use crate::models::{Artifact, GenerationJob, JobStatus, MotionParams, PollOutcome, PollPolicy};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remote side of the image-to-video service: one call to start a job, one
/// call to check on it.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    /// Start a job and return its opaque id.
    async fn submit(&self, image: Vec<u8>, params: MotionParams) -> Result<String, JobError>;

    /// Check a job once. Anything other than ready or in-progress is an error.
    async fn poll(&self, job_id: &str) -> Result<PollOutcome, JobError>;
}

/// Drives an asynchronous render job to a finished clip or a definite error.
///
/// ```text
/// Submitted -> Polling <-> sleep -> Succeeded | Failed | TimedOut
/// ```
///
/// The wait between polls is a tokio timer, so dropping the future cancels the
/// job wait without blocking a thread.
#[derive(Clone)]
pub struct VideoJobClient {
    backend: Arc<dyn VideoBackend>,
    policy: PollPolicy,
}

impl VideoJobClient {
    pub fn new(backend: Arc<dyn VideoBackend>, policy: PollPolicy) -> Self {
        VideoJobClient { backend, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub async fn submit(
        &self,
        image: Vec<u8>,
        params: MotionParams,
    ) -> Result<GenerationJob, JobError> {
        let job_id = self.backend.submit(image, params).await?;
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(JobError::Submission(
                "service returned an empty job id".to_string(),
            ));
        }
        info!(
            job_id,
            cfg_scale = params.cfg_scale(),
            motion_bucket_id = params.motion_bucket_id(),
            "Video job submitted"
        );
        Ok(GenerationJob::submitted(job_id))
    }

    /// Poll `job` until it is ready, fails, or `policy.max_attempts` checks
    /// have been spent. There is no sleep after the last check.
    pub async fn await_result(
        &self,
        mut job: GenerationJob,
        policy: PollPolicy,
    ) -> Result<Vec<u8>, JobError> {
        for attempt in 1..=policy.max_attempts {
            match self.backend.poll(&job.job_id).await {
                Ok(PollOutcome::Ready(bytes)) => {
                    job.status = JobStatus::Complete;
                    info!(
                        job_id = %job.job_id,
                        attempt,
                        elapsed = ?job.submitted_at.elapsed(),
                        "Video generation complete"
                    );
                    return Ok(bytes);
                }
                Ok(PollOutcome::InProgress) => {
                    debug!(
                        job_id = %job.job_id,
                        "Generation in progress, attempt {} of {}",
                        attempt,
                        policy.max_attempts
                    );
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.interval).await;
                    }
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    warn!(job_id = %job.job_id, attempt, "Video job failed: {}", e);
                    return Err(e);
                }
            }
        }

        warn!(
            job_id = %job.job_id,
            status = ?job.status,
            "Video job still running after {} attempts",
            policy.max_attempts
        );
        Err(JobError::Timeout {
            job_id: job.job_id,
            attempts: policy.max_attempts,
        })
    }

    /// Submit, wait with the client's policy, and write the clip to `dest`.
    /// Nothing is written unless the job succeeds.
    pub async fn render_to(
        &self,
        image: Vec<u8>,
        params: MotionParams,
        dest: &Path,
    ) -> Result<Artifact, ChapterError> {
        let job = self.submit(image, params).await.map_err(ChapterError::Video)?;
        let bytes = self
            .await_result(job, self.policy)
            .await
            .map_err(ChapterError::Video)?;
        let artifact = Artifact::new(dest, bytes);
        artifact.persist().await?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Replays a fixed sequence of poll outcomes, then keeps reporting
    /// in-progress.
    struct ScriptedBackend {
        submit_result: Result<String, JobError>,
        polls: Mutex<VecDeque<Result<PollOutcome, JobError>>>,
        poll_calls: AtomicUsize,
        submitted: Mutex<Vec<MotionParams>>,
    }

    impl ScriptedBackend {
        fn new(polls: Vec<Result<PollOutcome, JobError>>) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                submit_result: Ok("job-42".to_string()),
                polls: Mutex::new(polls.into()),
                poll_calls: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
            })
        }

        fn rejecting(message: &str) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                submit_result: Err(JobError::Submission(message.to_string())),
                polls: Mutex::new(VecDeque::new()),
                poll_calls: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.poll_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VideoBackend for ScriptedBackend {
        async fn submit(&self, _image: Vec<u8>, params: MotionParams) -> Result<String, JobError> {
            self.submitted.lock().unwrap().push(params);
            self.submit_result.clone()
        }

        async fn poll(&self, job_id: &str) -> Result<PollOutcome, JobError> {
            assert_eq!(job_id, "job-42");
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PollOutcome::InProgress))
        }
    }

    fn policy(attempts: u32) -> PollPolicy {
        PollPolicy::new(attempts, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_submit_accepts_all_valid_params() {
        let backend = ScriptedBackend::new(vec![]);
        let client = VideoJobClient::new(backend.clone(), PollPolicy::default());
        for (cfg, bucket) in [(1.0, 1), (1.8, 127), (10.0, 255), (5.0, 50)] {
            let params = MotionParams::new(cfg, bucket).unwrap();
            let job = client.submit(vec![0u8; 4], params).await.unwrap();
            assert_eq!(job.job_id, "job-42");
            assert_eq!(job.status, JobStatus::Pending);
        }
        assert_eq!(backend.submitted.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_submit_rejection_is_submission_error() {
        let client = VideoJobClient::new(ScriptedBackend::rejecting("bad image"), policy(6));
        let err = client
            .submit(vec![1], MotionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Submission(ref m) if m == "bad image"));
    }

    #[tokio::test]
    async fn test_blank_job_id_is_submission_error() {
        let backend = Arc::new(ScriptedBackend {
            submit_result: Ok("  ".to_string()),
            polls: Mutex::new(VecDeque::new()),
            poll_calls: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        });
        let client = VideoJobClient::new(backend, policy(6));
        let err = client
            .submit(vec![1], MotionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Submission(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_n_minus_one_in_progress() {
        let n = 4;
        let mut script: Vec<_> = (0..n - 1).map(|_| Ok(PollOutcome::InProgress)).collect();
        script.push(Ok(PollOutcome::Ready(b"mp4".to_vec())));
        let backend = ScriptedBackend::new(script);
        let client = VideoJobClient::new(backend.clone(), policy(6));

        let job = GenerationJob::submitted("job-42");
        let start = Instant::now();
        let bytes = client.await_result(job, policy(6)).await.unwrap();

        assert_eq!(bytes, b"mp4");
        assert_eq!(backend.calls(), n);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_max_attempts_without_trailing_sleep() {
        let backend = ScriptedBackend::new(vec![]);
        let client = VideoJobClient::new(backend.clone(), policy(3));

        let start = Instant::now();
        let err = client
            .await_result(GenerationJob::submitted("job-42"), policy(3))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Timeout { ref job_id, attempts: 3 } if job_id == "job-42"));
        assert_eq!(backend.calls(), 3);
        // two sleeps between three polls, none after the last
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(20) && waited < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_on_first_poll_stops_immediately() {
        let backend = ScriptedBackend::new(vec![
            Err(JobError::Generation("content_moderation".into())),
            Ok(PollOutcome::Ready(b"never".to_vec())),
        ]);
        let client = VideoJobClient::new(backend.clone(), policy(6));

        let start = Instant::now();
        let err = client
            .await_result(GenerationJob::submitted("job-42"), policy(6))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Generation(_)));
        assert_eq!(backend.calls(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_in_progress_is_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Ok(PollOutcome::InProgress),
            Err(JobError::Generation("server_error".into())),
        ]);
        let client = VideoJobClient::new(backend.clone(), policy(6));
        let err = client
            .await_result(GenerationJob::submitted("job-42"), policy(6))
            .await
            .unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_times_out_without_polling() {
        let backend = ScriptedBackend::new(vec![Ok(PollOutcome::Ready(vec![1]))]);
        let client = VideoJobClient::new(backend.clone(), policy(0));
        let err = client
            .await_result(GenerationJob::submitted("job-42"), policy(0))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_to_writes_only_on_success() {
        let dir = tempfile::tempdir().unwrap();

        let ok = ScriptedBackend::new(vec![Ok(PollOutcome::Ready(b"clip".to_vec()))]);
        let client = VideoJobClient::new(ok, policy(2));
        let dest = dir.path().join("ok.mp4");
        let artifact = client
            .render_to(vec![1], MotionParams::default(), &dest)
            .await
            .unwrap();
        assert_eq!(artifact.path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"clip");

        let pending = ScriptedBackend::new(vec![]);
        let client = VideoJobClient::new(pending, policy(2));
        let dest = dir.path().join("timeout.mp4");
        let err = client
            .render_to(vec![1], MotionParams::default(), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, ChapterError::Video(JobError::Timeout { .. })));
        assert!(!dest.exists());
    }
}
