// CRUD and relevance-ranking operations for Learnings (§4.6 step 1,
// §8 keyword-overlap scoring).

use rusqlite::{params, Connection, Result as SqliteResult};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db_utils::{columns, DatabaseOps, QueryBuilder};
use crate::models::{Learning, LearningCategory};

fn row_to_learning(row: &rusqlite::Row) -> SqliteResult<Learning> {
    let category_str: String = row.get(4)?;
    let keywords_json: Option<String> = row.get(7)?;
    Ok(Learning {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        project_name: row.get(2)?,
        source_task_id: row.get(3)?,
        category: LearningCategory::from_str(&category_str),
        title: row.get(5)?,
        content: row.get(6)?,
        relevance_keywords: keywords_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        usage_count: row.get(8)?,
        confidence: row.get(9)?,
        last_used: row.get(10)?,
        is_active: row.get::<_, i64>(11)? != 0,
        created_at: row.get(12)?,
    })
}

pub struct LearningOps<'a> {
    db: &'a Arc<Mutex<Connection>>,
}

impl<'a> LearningOps<'a> {
    pub fn new(db: &'a Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        &self,
        user_id: &str,
        project_name: Option<&str>,
        source_task_id: Option<i64>,
        category: LearningCategory,
        title: &str,
        content: &str,
        relevance_keywords: Vec<String>,
        confidence: f64,
    ) -> SqliteResult<Learning> {
        let user_id = user_id.to_string();
        let project_name = project_name.map(|s| s.to_string());
        let title = title.to_string();
        let content = content.to_string();
        let keywords_json = serde_json::to_string(&relevance_keywords).unwrap_or_default();
        let now = chrono::Utc::now().to_rfc3339();

        let id = self
            .db
            .with_db(move |db| {
                db.execute(
                    "INSERT INTO learnings (user_id, project_name, source_task_id, category, title,
                        content, relevance_keywords, usage_count, confidence, last_used, is_active, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, NULL, 1, ?9)",
                    params![
                        user_id,
                        project_name,
                        source_task_id,
                        category.as_str(),
                        title,
                        content,
                        keywords_json,
                        confidence,
                        now,
                    ],
                )?;
                Ok(db.last_insert_rowid())
            })
            .await?;

        Ok(self.get(id).await?.expect("row just inserted"))
    }

    pub async fn get(&self, id: i64) -> SqliteResult<Option<Learning>> {
        self.db
            .with_db(move |db| {
                let query = format!("SELECT {} FROM learnings WHERE id = ?1", columns::LEARNINGS);
                let mut stmt = db.prepare(&query)?;
                let mut rows = stmt.query(params![id])?;
                rows.next()?.map(|r| row_to_learning(r)).transpose()
            })
            .await
    }

    pub async fn list(
        &self,
        user_id: &str,
        project_name: Option<&str>,
        category: Option<LearningCategory>,
        limit: usize,
    ) -> SqliteResult<Vec<Learning>> {
        let user_id = user_id.to_string();
        let project_name = project_name.map(|s| s.to_string());

        self.db
            .with_db(move |db| {
                let base_query = format!("SELECT {} FROM learnings WHERE 1=1", columns::LEARNINGS);
                let mut builder = QueryBuilder::new(&base_query);
                builder.add_condition("user_id = ?", user_id);
                builder.add_condition("is_active = 1", 1i64);
                if let Some(project_name) = project_name {
                    builder.add_condition("project_name = ?", project_name);
                }
                if let Some(category) = category {
                    builder.add_condition("category = ?", category.as_str().to_string());
                }
                builder.add_order_by("confidence DESC, usage_count DESC");
                builder.add_limit(limit);

                let (query, query_params) = builder.build();
                let mut stmt = db.prepare(&query)?;
                let param_refs = QueryBuilder::params_as_refs(&query_params);
                let learnings = stmt.query_map(param_refs.as_slice(), row_to_learning)?;
                learnings.collect()
            })
            .await
    }

    /// Keyword-overlap ranking against a query string (§4.6 step 1):
    /// title words weighted 0.5, content 0.3, keywords 0.2, scaled by
    /// confidence and a small bonus for usage_count, threshold 0.1.
    /// Matching rows have usage_count incremented and last_used stamped.
    pub async fn get_relevant(
        &self,
        user_id: &str,
        project_name: Option<&str>,
        query: &str,
        limit: usize,
    ) -> SqliteResult<Vec<Learning>> {
        let candidates = self.list(user_id, project_name, None, 500).await?;
        let query_words: HashSet<String> = tokenize(query);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f64, Learning)> = candidates
            .into_iter()
            .map(|l| {
                let score = relevance_score(&l, &query_words);
                (score, l)
            })
            .filter(|(score, _)| *score >= 0.1)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let matched: Vec<Learning> = scored.into_iter().map(|(_, l)| l).collect();
        for learning in &matched {
            if let Some(id) = learning.id {
                self.mark_used(id).await?;
            }
        }
        Ok(matched)
    }

    async fn mark_used(&self, id: i64) -> SqliteResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db(move |db| {
                db.execute(
                    "UPDATE learnings SET usage_count = usage_count + 1, last_used = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Deactivate learnings unused for longer than `days_threshold`;
    /// returns the count deactivated.
    pub async fn decay_unused(&self, days_threshold: i64) -> SqliteResult<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days_threshold)).to_rfc3339();
        self.db
            .with_db(move |db| {
                db.execute(
                    "UPDATE learnings SET is_active = 0
                     WHERE is_active = 1
                       AND (
                         (last_used IS NOT NULL AND last_used < ?1)
                         OR (last_used IS NULL AND created_at < ?1)
                       )",
                    params![cutoff],
                )
            })
            .await
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

fn overlap_ratio(haystack: &HashSet<String>, query_words: &HashSet<String>) -> f64 {
    if haystack.is_empty() || query_words.is_empty() {
        return 0.0;
    }
    let hits = query_words.intersection(haystack).count();
    hits as f64 / query_words.len() as f64
}

fn relevance_score(learning: &Learning, query_words: &HashSet<String>) -> f64 {
    let title_words = tokenize(&learning.title);
    let content_words = tokenize(&learning.content);
    let keyword_words: HashSet<String> = learning
        .relevance_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect();

    let title_score = overlap_ratio(&title_words, query_words) * 0.5;
    let content_score = overlap_ratio(&content_words, query_words) * 0.3;
    let keyword_score = overlap_ratio(&keyword_words, query_words) * 0.2;

    let base = title_score + content_score + keyword_score;
    let usage_bonus = 1.0 + (learning.usage_count as f64).min(10.0) * 0.01;

    base * learning.confidence * usage_bonus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::initialize_schema;

    async fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[tokio::test]
    async fn get_relevant_ranks_by_keyword_overlap() {
        let db = setup().await;
        let ops = LearningOps::new(&db);
        ops.store(
            "u",
            Some("p"),
            None,
            LearningCategory::Pitfall,
            "async mutex deadlock",
            "avoid holding the mutex across an await point",
            vec!["mutex".into(), "deadlock".into(), "async".into()],
            0.8,
        )
        .await
        .unwrap();
        ops.store(
            "u",
            Some("p"),
            None,
            LearningCategory::Pattern,
            "unrelated formatting note",
            "prefer four-space indentation",
            vec!["formatting".into()],
            0.5,
        )
        .await
        .unwrap();

        let relevant = ops.get_relevant("u", Some("p"), "mutex deadlock in async code", 5).await.unwrap();
        assert_eq!(relevant.len(), 1);
        assert_eq!(relevant[0].title, "async mutex deadlock");
    }

    #[tokio::test]
    async fn decay_unused_deactivates_old_learnings() {
        let db = setup().await;
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO learnings (user_id, project_name, category, title, content, usage_count, confidence, is_active, created_at)
                 VALUES ('u', 'p', 'pattern', 'old', 'old content', 0, 0.5, 1, '2000-01-01T00:00:00+00:00')",
                [],
            )
            .unwrap();
        }

        let ops = LearningOps::new(&db);
        let count = ops.decay_unused(30).await.unwrap();
        assert_eq!(count, 1);
    }
}
