//! Evaluation persistence.
//!
//! Evaluators are opaque to the engine; this store only records their
//! numeric verdicts and derives the overall score as a weighted mean
//! over whichever dimensions are present.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::types::{from_unix, Evaluation, EvaluationScores};

const EVALUATION_COLUMNS: &str = "id, subtask_id, code_quality, completeness, security, \
     architecture, testability, overall_score, details, evaluated_at";

/// Relative weight of each dimension in the overall score.
///
/// The mean is normalized over the weights of the dimensions actually
/// present, so a missing evaluator does not drag the score down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub code_quality: f64,
    pub completeness: f64,
    pub security: f64,
    pub architecture: f64,
    pub testability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            code_quality: 0.30,
            completeness: 0.25,
            security: 0.20,
            architecture: 0.15,
            testability: 0.10,
        }
    }
}

impl ScoreWeights {
    /// Weighted mean over the non-null dimensions; `None` when every
    /// dimension is absent.
    pub fn overall(&self, scores: &EvaluationScores) -> Option<f64> {
        let pairs = [
            (scores.code_quality, self.code_quality),
            (scores.completeness, self.completeness),
            (scores.security, self.security),
            (scores.architecture, self.architecture),
            (scores.testability, self.testability),
        ];

        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (score, weight) in pairs {
            if let Some(score) = score {
                weighted += score * weight;
                weight_sum += weight;
            }
        }

        (weight_sum > 0.0).then(|| weighted / weight_sum)
    }
}

/// CRUD operations on evaluations.
#[derive(Clone)]
pub struct EvaluationStore {
    db: Database,
}

impl EvaluationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an evaluation and return it with the derived overall score.
    #[instrument(skip(self, scores, details, weights))]
    pub async fn record(
        &self,
        subtask_id: Uuid,
        scores: EvaluationScores,
        details: serde_json::Value,
        weights: &ScoreWeights,
    ) -> StoreResult<Evaluation> {
        let overall = weights.overall(&scores).ok_or_else(|| {
            StoreError::InvalidArgument("evaluation carries no dimension scores".into())
        })?;

        for (name, value) in [
            ("code_quality", scores.code_quality),
            ("completeness", scores.completeness),
            ("security", scores.security),
            ("architecture", scores.architecture),
            ("testability", scores.testability),
        ] {
            if let Some(v) = value {
                if !(0.0..=10.0).contains(&v) {
                    return Err(StoreError::InvalidArgument(format!(
                        "{name} score {v} outside [0, 10]"
                    )));
                }
            }
        }

        let id = Uuid::now_v7();
        let now = Utc::now().timestamp();
        let details_json = serde_json::to_string(&details)?;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO evaluations (id, subtask_id, code_quality, completeness, \
                     security, architecture, testability, overall_score, details, evaluated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        id.to_string(),
                        subtask_id.to_string(),
                        scores.code_quality,
                        scores.completeness,
                        scores.security,
                        scores.architecture,
                        scores.testability,
                        overall,
                        details_json,
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(evaluation_id = %id, subtask_id = %subtask_id, overall, "evaluation recorded");

        Ok(Evaluation {
            id,
            subtask_id,
            code_quality: scores.code_quality,
            completeness: scores.completeness,
            security: scores.security,
            architecture: scores.architecture,
            testability: scores.testability,
            overall_score: overall,
            details,
            evaluated_at: from_unix(now),
        })
    }

    /// Most recent evaluation of a subtask, if any.
    #[instrument(skip(self))]
    pub async fn latest_for_subtask(&self, subtask_id: Uuid) -> StoreResult<Option<Evaluation>> {
        let subtask_id = subtask_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE subtask_id = ?1 \
                         ORDER BY evaluated_at DESC, id DESC LIMIT 1"
                    ),
                    rusqlite::params![subtask_id],
                    EvaluationRow::from_row,
                );
                match result {
                    Ok(row) => row.into_evaluation().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// All evaluations of a subtask, oldest first.
    #[instrument(skip(self))]
    pub async fn list_for_subtask(&self, subtask_id: Uuid) -> StoreResult<Vec<Evaluation>> {
        let subtask_id = subtask_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE subtask_id = ?1 \
                     ORDER BY evaluated_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![subtask_id], EvaluationRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(EvaluationRow::into_evaluation).collect()
            })
            .await
    }

    /// Mean overall score across all evaluations, for gauge refresh.
    pub async fn average_overall(&self) -> StoreResult<Option<f64>> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT avg(overall_score) FROM evaluations",
                    [],
                    |row| row.get::<_, Option<f64>>(0),
                )?)
            })
            .await
    }
}

// ── row mapping ──────────────────────────────────────────────────────

struct EvaluationRow {
    id: String,
    subtask_id: String,
    code_quality: Option<f64>,
    completeness: Option<f64>,
    security: Option<f64>,
    architecture: Option<f64>,
    testability: Option<f64>,
    overall_score: f64,
    details: String,
    evaluated_at: i64,
}

impl EvaluationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subtask_id: row.get(1)?,
            code_quality: row.get(2)?,
            completeness: row.get(3)?,
            security: row.get(4)?,
            architecture: row.get(5)?,
            testability: row.get(6)?,
            overall_score: row.get(7)?,
            details: row.get(8)?,
            evaluated_at: row.get(9)?,
        })
    }

    fn into_evaluation(self) -> StoreResult<Evaluation> {
        Ok(Evaluation {
            id: Uuid::parse_str(&self.id).map_err(|_| {
                StoreError::InvalidArgument(format!("bad evaluation id {}", self.id))
            })?,
            subtask_id: Uuid::parse_str(&self.subtask_id).map_err(|_| {
                StoreError::InvalidArgument(format!("bad subtask id {}", self.subtask_id))
            })?,
            code_quality: self.code_quality,
            completeness: self.completeness,
            security: self.security,
            architecture: self.architecture,
            testability: self.testability,
            overall_score: self.overall_score,
            details: serde_json::from_str(&self.details)?,
            evaluated_at: from_unix(self.evaluated_at),
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtask_store::SubtaskStore;
    use crate::task_store::TaskStore;
    use crate::types::{NewSubtask, NewTask, SubtaskType};

    async fn fixture() -> (EvaluationStore, Uuid) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let task = TaskStore::new(db.clone())
            .create(NewTask {
                description: "evaluation fixture".into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        let subtask = NewSubtask {
            id: Uuid::now_v7(),
            task_id: task.id,
            name: "Code Generation".into(),
            description: "generate code".into(),
            subtask_type: SubtaskType::CodeGeneration,
            dependencies: vec![],
            recommended_tool: None,
            complexity: 2,
            priority: 0,
        };
        let subtask_id = subtask.id;
        SubtaskStore::new(db.clone())
            .create_batch(vec![subtask])
            .await
            .unwrap();

        (EvaluationStore::new(db), subtask_id)
    }

    #[test]
    fn overall_ignores_missing_dimensions() {
        let weights = ScoreWeights::default();

        let full = EvaluationScores {
            code_quality: Some(8.0),
            completeness: Some(8.0),
            security: Some(8.0),
            architecture: Some(8.0),
            testability: Some(8.0),
        };
        let overall = weights.overall(&full).unwrap();
        assert!((overall - 8.0).abs() < 1e-9);

        let partial = EvaluationScores {
            code_quality: Some(5.0),
            completeness: Some(6.0),
            security: Some(5.5),
            ..Default::default()
        };
        let overall = weights.overall(&partial).unwrap();
        // Normalized over present weights, so it stays in the 5–6 band.
        assert!(overall > 5.0 && overall < 6.0);

        assert!(weights.overall(&EvaluationScores::default()).is_none());
    }

    #[tokio::test]
    async fn record_and_fetch_latest() {
        let (store, subtask_id) = fixture().await;
        let weights = ScoreWeights::default();

        store
            .record(
                subtask_id,
                EvaluationScores {
                    code_quality: Some(9.0),
                    completeness: Some(9.0),
                    ..Default::default()
                },
                serde_json::json!({"evaluator": "sim"}),
                &weights,
            )
            .await
            .unwrap();
        let second = store
            .record(
                subtask_id,
                EvaluationScores {
                    code_quality: Some(5.0),
                    completeness: Some(6.0),
                    security: Some(5.5),
                    ..Default::default()
                },
                serde_json::json!({"evaluator": "sim"}),
                &weights,
            )
            .await
            .unwrap();
        assert!(second.overall_score < 7.0);

        let latest = store
            .latest_for_subtask(subtask_id)
            .await
            .unwrap()
            .expect("latest evaluation");
        assert!(latest.overall_score < 7.0);

        let all = store.list_for_subtask(subtask_id).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn out_of_range_score_rejected() {
        let (store, subtask_id) = fixture().await;
        let err = store
            .record(
                subtask_id,
                EvaluationScores {
                    code_quality: Some(11.0),
                    ..Default::default()
                },
                serde_json::json!({}),
                &ScoreWeights::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn empty_scores_rejected() {
        let (store, subtask_id) = fixture().await;
        let err = store
            .record(
                subtask_id,
                EvaluationScores::default(),
                serde_json::json!({}),
                &ScoreWeights::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
