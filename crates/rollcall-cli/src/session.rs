//! Attendance-marking session.
//!
//! A dedicated OS thread owns the gallery for the life of the session.
//! Callers submit the query embeddings of one frame at a time and get back
//! one outcome per face. Accepted labels are handed to a [`Recorder`].

use chrono::NaiveDateTime;
use rollcall_core::{DistanceKind, Embedding, Gallery, MatchError, MatchResult, Matcher, NearestMatcher};
use rollcall_store::{parse_label, AttendanceRecord, AttendanceStore, MarkOutcome, StoreError};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("session thread exited")]
    ChannelClosed,
}

/// What happened to one detected face.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceOutcome {
    /// No gallery entry within the threshold.
    Unknown { distance: Option<f32> },
    /// Matched and recorded.
    Marked { label: String, record: AttendanceRecord },
    /// Matched, but already recorded for that date.
    AlreadyMarked { label: String, student_id: String },
    /// Matched, but the recorder failed; nothing was written for this face.
    Failed { label: String, error: String },
}

/// Persists an accepted match.
pub trait Recorder: Send + 'static {
    fn record(&mut self, label: &str, at: NaiveDateTime) -> Result<MarkOutcome, StoreError>;
}

/// Records into the SQLite store, opening a fresh connection per write.
///
/// The student ID comes from the label prefix; the name is taken from the
/// registry when the student is registered, else from the label.
pub struct StoreRecorder {
    db_path: PathBuf,
}

impl StoreRecorder {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl Recorder for StoreRecorder {
    fn record(&mut self, label: &str, at: NaiveDateTime) -> Result<MarkOutcome, StoreError> {
        let store = AttendanceStore::open(&self.db_path)?;
        let (student_id, label_name) = parse_label(label);
        let name = store
            .find_student(student_id)?
            .map(|s| s.name)
            .unwrap_or_else(|| label_name.to_string());
        store.mark_present(student_id, &name, at)
    }
}

/// Messages sent from callers to the session thread.
struct FrameRequest {
    faces: Vec<Embedding>,
    at: NaiveDateTime,
    reply: oneshot::Sender<Result<Vec<FaceOutcome>, SessionError>>,
}

/// Clone-safe handle to the session thread.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<FrameRequest>,
}

impl SessionHandle {
    /// Match every face of one frame and record accepted identities.
    ///
    /// A dimensionality mismatch on any face rejects the whole frame before
    /// anything is recorded. Recorder errors are reported per face as
    /// [`FaceOutcome::Failed`] and do not stop the remaining faces.
    pub async fn submit(
        &self,
        faces: Vec<Embedding>,
        at: NaiveDateTime,
    ) -> Result<Vec<FaceOutcome>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(FrameRequest {
                faces,
                at,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }
}

/// Spawn the session on a dedicated OS thread.
///
/// The thread exits once every [`SessionHandle`] has been dropped.
pub fn spawn_session<R: Recorder>(
    gallery: Gallery,
    threshold: f32,
    distance: DistanceKind,
    mut recorder: R,
) -> Result<SessionHandle, SessionError> {
    tracing::info!(
        identities = gallery.len(),
        dimension = ?gallery.dimension(),
        threshold,
        %distance,
        "starting attendance session"
    );

    let (tx, mut rx) = mpsc::channel::<FrameRequest>(4);
    let matcher = NearestMatcher::new(distance);

    std::thread::Builder::new()
        .name("rollcall-session".into())
        .spawn(move || {
            tracing::debug!("session thread started");
            let mut frames = 0usize;
            while let Some(req) = rx.blocking_recv() {
                frames += 1;
                let result = run_frame(&matcher, &gallery, threshold, &mut recorder, &req.faces, req.at);
                let _ = req.reply.send(result);
            }
            tracing::info!(frames, "attendance session finished");
        })?;

    Ok(SessionHandle { tx })
}

fn run_frame<M: Matcher, R: Recorder>(
    matcher: &M,
    gallery: &Gallery,
    threshold: f32,
    recorder: &mut R,
    faces: &[Embedding],
    at: NaiveDateTime,
) -> Result<Vec<FaceOutcome>, SessionError> {
    let results = faces
        .iter()
        .map(|face| matcher.compare(face, gallery, threshold))
        .collect::<Result<Vec<MatchResult>, _>>()?;
    tracing::debug!(faces = results.len(), "frame matched");

    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        let Some(label) = result.label else {
            outcomes.push(FaceOutcome::Unknown {
                distance: result.distance,
            });
            continue;
        };

        let outcome = match recorder.record(&label, at) {
            Ok(MarkOutcome::Marked(record)) => FaceOutcome::Marked { label, record },
            Ok(MarkOutcome::AlreadyMarked { student_id, .. }) => {
                FaceOutcome::AlreadyMarked { label, student_id }
            }
            Ok(MarkOutcome::UnknownStudent(student_id)) => {
                tracing::warn!(label = %label, student_id = %student_id, "recorder rejected matched identity");
                FaceOutcome::Unknown {
                    distance: result.distance,
                }
            }
            Err(e) => {
                tracing::warn!(label = %label, error = %e, "failed to record attendance");
                FaceOutcome::Failed {
                    label,
                    error: e.to_string(),
                }
            }
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn at(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn gallery() -> Gallery {
        let mut g = Gallery::new();
        g.insert("A1_Alice", emb(&[0.0, 0.0])).unwrap();
        g.insert("B2_Bob", emb(&[10.0, 10.0])).unwrap();
        g
    }

    /// Records labels in memory, enforcing once-per-day per label.
    #[derive(Clone, Default)]
    struct MemoryRecorder {
        seen: Arc<Mutex<Vec<(String, NaiveDate)>>>,
    }

    impl Recorder for MemoryRecorder {
        fn record(&mut self, label: &str, at: NaiveDateTime) -> Result<MarkOutcome, StoreError> {
            let (student_id, name) = parse_label(label);
            let mut seen = self.seen.lock().unwrap();
            let key = (student_id.to_string(), at.date());
            if seen.contains(&key) {
                return Ok(MarkOutcome::AlreadyMarked {
                    student_id: student_id.into(),
                    name: name.into(),
                });
            }
            seen.push(key);
            Ok(MarkOutcome::Marked(AttendanceRecord {
                id: seen.len() as i64,
                student_id: student_id.into(),
                name: name.into(),
                date: at.date(),
                time: at.time(),
                status: rollcall_store::STATUS_PRESENT.into(),
            }))
        }
    }

    #[tokio::test]
    async fn test_session_marks_known_faces_once() {
        let recorder = MemoryRecorder::default();
        let handle = spawn_session(gallery(), 2.0, DistanceKind::Euclidean, recorder.clone()).unwrap();

        let outcomes = handle
            .submit(vec![emb(&[1.0, 0.0]), emb(&[5.0, 5.0])], at(5, 9))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(&outcomes[0], FaceOutcome::Marked { label, .. } if label == "A1_Alice"));
        match &outcomes[1] {
            FaceOutcome::Unknown { distance } => assert!(distance.unwrap() > 7.0),
            other => panic!("unexpected outcome {other:?}"),
        }

        let again = handle.submit(vec![emb(&[0.5, 0.5])], at(5, 10)).await.unwrap();
        assert_eq!(
            again,
            vec![FaceOutcome::AlreadyMarked {
                label: "A1_Alice".into(),
                student_id: "A1".into()
            }]
        );

        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_rejects_mismatched_frame_without_recording() {
        let recorder = MemoryRecorder::default();
        let handle = spawn_session(gallery(), 2.0, DistanceKind::Euclidean, recorder.clone()).unwrap();

        let err = handle
            .submit(vec![emb(&[0.0, 0.0]), emb(&[1.0, 2.0, 3.0])], at(5, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Match(MatchError::InvalidInput(_))));
        assert!(recorder.seen.lock().unwrap().is_empty());

        // The session keeps serving after a rejected frame.
        let outcomes = handle.submit(vec![emb(&[0.0, 0.0])], at(5, 9)).await.unwrap();
        assert!(matches!(outcomes[0], FaceOutcome::Marked { .. }));
    }

    /// Fails every write after the first.
    #[derive(Clone, Default)]
    struct FlakyRecorder {
        calls: Arc<Mutex<usize>>,
        inner: MemoryRecorder,
    }

    impl Recorder for FlakyRecorder {
        fn record(&mut self, label: &str, at: NaiveDateTime) -> Result<MarkOutcome, StoreError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls > 1 {
                return Err(StoreError::Io {
                    path: PathBuf::from("attendance.db"),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.record(label, at)
        }
    }

    #[tokio::test]
    async fn test_session_reports_recorder_failure_per_face() {
        let recorder = FlakyRecorder::default();
        let handle = spawn_session(gallery(), 2.0, DistanceKind::Euclidean, recorder.clone()).unwrap();

        let outcomes = handle
            .submit(
                vec![emb(&[0.0, 0.0]), emb(&[10.0, 10.0]), emb(&[50.0, 50.0])],
                at(5, 9),
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(&outcomes[0], FaceOutcome::Marked { label, .. } if label == "A1_Alice"));
        match &outcomes[1] {
            FaceOutcome::Failed { label, error } => {
                assert_eq!(label, "B2_Bob");
                assert!(error.contains("disk full"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(outcomes[2], FaceOutcome::Unknown { .. }));

        assert_eq!(*recorder.calls.lock().unwrap(), 2);
        assert_eq!(recorder.inner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_empty_frame_and_empty_gallery() {
        let handle =
            spawn_session(Gallery::new(), 0.6, DistanceKind::Euclidean, MemoryRecorder::default()).unwrap();
        assert!(handle.submit(vec![], at(5, 9)).await.unwrap().is_empty());
        let outcomes = handle.submit(vec![emb(&[0.1, 0.2])], at(5, 9)).await.unwrap();
        assert_eq!(outcomes, vec![FaceOutcome::Unknown { distance: None }]);
    }

    #[tokio::test]
    async fn test_store_recorder_uses_registered_name() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("attendance.db");
        AttendanceStore::open(&db_path)
            .unwrap()
            .register_student("Alice Liddell", "A1", at(1, 0).date())
            .unwrap();

        let handle =
            spawn_session(gallery(), 2.0, DistanceKind::Euclidean, StoreRecorder::new(&db_path)).unwrap();
        let outcomes = handle
            .submit(vec![emb(&[0.0, 0.1]), emb(&[10.0, 10.0])], at(5, 9))
            .await
            .unwrap();

        match &outcomes[0] {
            FaceOutcome::Marked { record, .. } => assert_eq!(record.name, "Alice Liddell"),
            other => panic!("unexpected outcome {other:?}"),
        }
        match &outcomes[1] {
            FaceOutcome::Marked { record, .. } => {
                assert_eq!(record.student_id, "B2");
                assert_eq!(record.name, "Bob");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let store = AttendanceStore::open(&db_path).unwrap();
        assert_eq!(store.list_attendance().unwrap().len(), 2);
    }
}
