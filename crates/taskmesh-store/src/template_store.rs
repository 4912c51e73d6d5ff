//! Workflow template registry.
//!
//! A stored template is a reusable decomposition recipe: an ordered list
//! of steps with name-based dependencies, plus task-level defaults
//! (checkpoint frequency, privacy, preferred tools). Applying one to a
//! task bumps its usage counter so popular templates sort first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::types::{from_unix, CheckpointFrequency, PrivacyLevel, SubtaskType};

/// One step of a stored workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStep {
    pub id: Uuid,
    pub template_id: Uuid,
    pub step_index: i32,
    pub name: String,
    pub description: String,
    pub subtask_type: SubtaskType,
    pub recommended_tool: Option<String>,
    pub complexity: i32,
    pub priority: i32,
    pub parallel: bool,
    /// Names of earlier steps this one depends on.
    pub depends_on: Vec<String>,
}

/// Step payload for template creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplateStep {
    pub name: String,
    pub description: String,
    pub subtask_type: SubtaskType,
    pub recommended_tool: Option<String>,
    pub complexity: i32,
    pub priority: i32,
    pub parallel: bool,
    pub depends_on: Vec<String>,
}

/// A stored workflow template with its steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub default_checkpoint_frequency: CheckpointFrequency,
    pub default_privacy_level: PrivacyLevel,
    pub preferred_tools: Vec<String>,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<TemplateStep>,
}

/// CRUD operations on workflow templates.
#[derive(Clone)]
pub struct TemplateStore {
    db: Database,
}

impl TemplateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a template with its steps in one transaction.
    #[instrument(skip(self, steps, description), fields(step_count = steps.len()))]
    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        category: Option<&str>,
        default_checkpoint_frequency: CheckpointFrequency,
        default_privacy_level: PrivacyLevel,
        preferred_tools: Vec<String>,
        steps: Vec<NewTemplateStep>,
    ) -> StoreResult<WorkflowTemplate> {
        if steps.is_empty() {
            return Err(StoreError::InvalidArgument(
                "template requires at least one step".into(),
            ));
        }

        let id = Uuid::now_v7();
        let now = Utc::now().timestamp();
        let name = name.to_string();
        let description = description.map(str::to_string);
        let category = category.map(str::to_string);
        let tools_json = serde_json::to_string(&preferred_tools)?;

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO workflow_templates (id, name, description, category, \
                     default_checkpoint_frequency, default_privacy_level, preferred_tools, \
                     usage_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
                    rusqlite::params![
                        id.to_string(),
                        name,
                        description,
                        category,
                        default_checkpoint_frequency.as_str(),
                        default_privacy_level.as_str(),
                        tools_json,
                        now
                    ],
                )?;

                for (index, step) in steps.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO template_steps (id, template_id, step_index, name, \
                         description, subtask_type, recommended_tool, complexity, priority, \
                         parallel, depends_on) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        rusqlite::params![
                            Uuid::now_v7().to_string(),
                            id.to_string(),
                            index as i32,
                            step.name,
                            step.description,
                            step.subtask_type.as_str(),
                            step.recommended_tool,
                            step.complexity,
                            step.priority,
                            step.parallel,
                            serde_json::to_string(&step.depends_on)?
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(template_id = %id, "workflow template created");
        self.get(id).await?.ok_or(StoreError::NotFound {
            entity: "workflow_template",
            id: id.to_string(),
        })
    }

    /// Fetch a template with steps, `None` when missing.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> StoreResult<Option<WorkflowTemplate>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| Self::load_where(conn, "id = ?1", &id))
            .await
    }

    /// Fetch a template by its unique name.
    #[instrument(skip(self))]
    pub async fn get_by_name(&self, name: &str) -> StoreResult<Option<WorkflowTemplate>> {
        let name = name.to_string();
        self.db
            .execute(move |conn| Self::load_where(conn, "name = ?1", &name))
            .await
    }

    /// List templates, most used first.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: i64) -> StoreResult<Vec<WorkflowTemplate>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM workflow_templates \
                     ORDER BY usage_count DESC, name ASC LIMIT ?1",
                )?;
                let ids: Vec<String> = stmt
                    .query_map(rusqlite::params![limit], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;

                let mut templates = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(t) = Self::load_where(conn, "id = ?1", &id)? {
                        templates.push(t);
                    }
                }
                Ok(templates)
            })
            .await
    }

    /// Bump the usage counter after a template is applied to a task.
    #[instrument(skip(self))]
    pub async fn increment_usage(&self, id: Uuid) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE workflow_templates SET usage_count = usage_count + 1, \
                     updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "workflow_template",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Delete a template and its steps.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM workflow_templates WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "workflow_template",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    fn load_where(
        conn: &rusqlite::Connection,
        predicate: &str,
        param: &str,
    ) -> StoreResult<Option<WorkflowTemplate>> {
        let result = conn.query_row(
            &format!(
                "SELECT id, name, description, category, default_checkpoint_frequency, \
                 default_privacy_level, preferred_tools, usage_count, created_at, updated_at \
                 FROM workflow_templates WHERE {predicate}"
            ),
            rusqlite::params![param],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                ))
            },
        );

        let row = match result {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Sqlite(e)),
        };

        let template_id = Uuid::parse_str(&row.0)
            .map_err(|_| StoreError::InvalidArgument(format!("bad template id {}", row.0)))?;

        let mut stmt = conn.prepare(
            "SELECT id, step_index, name, description, subtask_type, recommended_tool, \
             complexity, priority, parallel, depends_on \
             FROM template_steps WHERE template_id = ?1 ORDER BY step_index ASC",
        )?;
        let steps = stmt
            .query_map(rusqlite::params![row.0], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i32>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, i32>(6)?,
                    r.get::<_, i32>(7)?,
                    r.get::<_, bool>(8)?,
                    r.get::<_, String>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|s| {
                Ok(TemplateStep {
                    id: Uuid::parse_str(&s.0)
                        .map_err(|_| StoreError::InvalidArgument(format!("bad step id {}", s.0)))?,
                    template_id,
                    step_index: s.1,
                    name: s.2,
                    description: s.3,
                    subtask_type: SubtaskType::parse(&s.4)?,
                    recommended_tool: s.5,
                    complexity: s.6,
                    priority: s.7,
                    parallel: s.8,
                    depends_on: serde_json::from_str(&s.9)?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(WorkflowTemplate {
            id: template_id,
            name: row.1,
            description: row.2,
            category: row.3,
            default_checkpoint_frequency: CheckpointFrequency::parse(&row.4)?,
            default_privacy_level: PrivacyLevel::parse(&row.5)?,
            preferred_tools: serde_json::from_str(&row.6)?,
            usage_count: row.7,
            created_at: from_unix(row.8),
            updated_at: from_unix(row.9),
            steps,
        }))
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TemplateStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        TemplateStore::new(db)
    }

    fn steps() -> Vec<NewTemplateStep> {
        vec![
            NewTemplateStep {
                name: "Design".into(),
                description: "Design the change".into(),
                subtask_type: SubtaskType::Analysis,
                recommended_tool: Some("claude_code".into()),
                complexity: 3,
                priority: 10,
                parallel: false,
                depends_on: vec![],
            },
            NewTemplateStep {
                name: "Implement".into(),
                description: "Implement the design".into(),
                subtask_type: SubtaskType::CodeGeneration,
                recommended_tool: Some("claude_code".into()),
                complexity: 4,
                priority: 8,
                parallel: false,
                depends_on: vec!["Design".into()],
            },
        ]
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let store = store().await;
        let created = store
            .create(
                "design-then-build",
                Some("two phase workflow"),
                Some("development"),
                CheckpointFrequency::Medium,
                PrivacyLevel::Normal,
                vec!["claude_code".into()],
                steps(),
            )
            .await
            .unwrap();

        assert_eq!(created.steps.len(), 2);
        assert_eq!(created.steps[0].name, "Design");
        assert_eq!(created.steps[1].depends_on, vec!["Design".to_string()]);
        assert_eq!(created.usage_count, 0);

        let by_name = store
            .get_by_name("design-then-build")
            .await
            .unwrap()
            .expect("template exists");
        assert_eq!(by_name.id, created.id);
    }

    #[tokio::test]
    async fn empty_template_rejected() {
        let store = store().await;
        let err = store
            .create(
                "empty",
                None,
                None,
                CheckpointFrequency::Low,
                PrivacyLevel::Normal,
                vec![],
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn usage_count_orders_listing() {
        let store = store().await;
        let a = store
            .create(
                "alpha",
                None,
                None,
                CheckpointFrequency::Medium,
                PrivacyLevel::Normal,
                vec![],
                steps(),
            )
            .await
            .unwrap();
        let _b = store
            .create(
                "beta",
                None,
                None,
                CheckpointFrequency::Medium,
                PrivacyLevel::Normal,
                vec![],
                steps(),
            )
            .await
            .unwrap();

        store.increment_usage(a.id).await.unwrap();
        store.increment_usage(a.id).await.unwrap();

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[0].usage_count, 2);
    }

    #[tokio::test]
    async fn delete_cascades_steps() {
        let store = store().await;
        let t = store
            .create(
                "gone-soon",
                None,
                None,
                CheckpointFrequency::Medium,
                PrivacyLevel::Normal,
                vec![],
                steps(),
            )
            .await
            .unwrap();

        store.delete(t.id).await.unwrap();
        assert!(store.get(t.id).await.unwrap().is_none());
    }
}
