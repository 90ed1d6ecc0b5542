//! Engagement counters for videos and the ranking built on them.
//!
//! Every counter is a node under `snails-social/<content>/<counter>` with
//! one field per user (or per view). Counts are the number of live fields.

use serde::Serialize;
use serde_json::{json, Value};

use snails_shared::constants::SOCIAL_ROOT;
use snails_shared::graph::now_state;
use snails_shared::{Address, GraphNode, GraphValue};

use crate::error::Result;
use crate::graph_client::GraphClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Views,
    Likes,
    Dislikes,
    Feedback,
    WatchTime,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Views => "views",
            Counter::Likes => "likes",
            Counter::Dislikes => "dislikes",
            Counter::Feedback => "feedback",
            Counter::WatchTime => "watchTime",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStats {
    pub content_id: String,
    pub likes: usize,
    pub dislikes: usize,
    pub views: usize,
    /// Seconds, summed over all users.
    pub watch_time: f64,
    pub feedback: usize,
    pub score: f64,
}

impl ContentStats {
    fn new(content_id: String, likes: usize, dislikes: usize, views: usize, watch_time: f64, feedback: usize) -> Self {
        let score = likes as f64 + views as f64 + watch_time / 60.0;
        Self {
            content_id,
            likes,
            dislikes,
            views,
            watch_time,
            feedback,
            score,
        }
    }
}

#[derive(Clone)]
pub struct AlgorithmService {
    graph: GraphClient,
}

impl AlgorithmService {
    pub fn new(graph: GraphClient) -> Self {
        Self { graph }
    }

    fn soul(content_id: &str, counter: Counter) -> String {
        format!("{SOCIAL_ROOT}/{content_id}/{}", counter.as_str())
    }

    async fn counter_node(&self, content_id: &str, counter: Counter) -> Result<Option<GraphNode>> {
        self.graph.get(&Self::soul(content_id, counter)).await
    }

    async fn record(&self, content_id: &str, counter: Counter, key: &str, value: Value) -> Result<()> {
        self.graph
            .put_value(&Self::soul(content_id, counter), key, value)
            .await
    }

    /// Count one view. Each view gets its own key, so concurrent viewers
    /// never overwrite each other.
    pub async fn view(&self, content_id: &str) -> Result<()> {
        let view_id = uuid::Uuid::new_v4().simple().to_string();
        self.record(content_id, Counter::Views, &view_id, json!(now_state()))
            .await
    }

    pub async fn like(&self, content_id: &str, user: &Address) -> Result<()> {
        self.record(content_id, Counter::Likes, user.as_str(), json!(true))
            .await
    }

    pub async fn dislike(&self, content_id: &str, user: &Address) -> Result<()> {
        self.record(content_id, Counter::Dislikes, user.as_str(), json!(true))
            .await
    }

    pub async fn submit_feedback(&self, content_id: &str, user: &Address, feedback: &str) -> Result<()> {
        self.record(content_id, Counter::Feedback, user.as_str(), json!(feedback))
            .await
    }

    /// Store how long `user` watched, replacing their previous value.
    pub async fn log_watch_time(&self, content_id: &str, user: &Address, seconds: f64) -> Result<()> {
        self.record(content_id, Counter::WatchTime, user.as_str(), json!(seconds))
            .await
    }

    pub async fn count(&self, content_id: &str, counter: Counter) -> Result<usize> {
        Ok(self
            .counter_node(content_id, counter)
            .await?
            .map(|node| node.live_keys().count())
            .unwrap_or(0))
    }

    /// Whether `user` has a live entry in `counter`.
    pub async fn has_entry(&self, content_id: &str, counter: Counter, user: &Address) -> Result<bool> {
        Ok(self
            .counter_node(content_id, counter)
            .await?
            .and_then(|node| node.get(user.as_str()).cloned())
            .is_some_and(|value| !matches!(value, GraphValue::Null | GraphValue::Bool(false))))
    }

    pub async fn total_watch_time(&self, content_id: &str) -> Result<f64> {
        Ok(self
            .counter_node(content_id, Counter::WatchTime)
            .await?
            .map(|node| node.fields.values().filter_map(|f| f.value.as_f64()).sum())
            .unwrap_or(0.0))
    }

    pub async fn watch_time_of(&self, content_id: &str, user: &Address) -> Result<f64> {
        Ok(self
            .counter_node(content_id, Counter::WatchTime)
            .await?
            .and_then(|node| node.get(user.as_str()).and_then(GraphValue::as_f64))
            .unwrap_or(0.0))
    }

    pub async fn stats(&self, content_id: &str) -> Result<ContentStats> {
        Ok(ContentStats::new(
            content_id.to_string(),
            self.count(content_id, Counter::Likes).await?,
            self.count(content_id, Counter::Dislikes).await?,
            self.count(content_id, Counter::Views).await?,
            self.total_watch_time(content_id).await?,
            self.count(content_id, Counter::Feedback).await?,
        ))
    }

    /// Every content with engagement, best score first.
    pub async fn top_content(&self) -> Result<Vec<ContentStats>> {
        let Some(root) = self.graph.get(SOCIAL_ROOT).await? else {
            return Ok(Vec::new());
        };

        let mut ranked = Vec::new();
        for content_id in root.live_keys() {
            ranked.push(self.stats(content_id).await?);
        }
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Address {
        Address::new("stars1alice")
    }

    fn bob() -> Address {
        Address::new("stars1bob")
    }

    #[tokio::test]
    async fn empty_content_counts_zero() {
        let algo = AlgorithmService::new(GraphClient::local());
        assert_eq!(algo.count("42", Counter::Likes).await.unwrap(), 0);
        assert_eq!(algo.total_watch_time("42").await.unwrap(), 0.0);
        assert!(algo.top_content().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn likes_are_per_user() {
        let algo = AlgorithmService::new(GraphClient::local());
        algo.like("42", &alice()).await.unwrap();
        algo.like("42", &alice()).await.unwrap();
        algo.like("42", &bob()).await.unwrap();
        algo.dislike("42", &bob()).await.unwrap();

        assert_eq!(algo.count("42", Counter::Likes).await.unwrap(), 2);
        assert_eq!(algo.count("42", Counter::Dislikes).await.unwrap(), 1);
        assert!(algo.has_entry("42", Counter::Dislikes, &bob()).await.unwrap());
        assert!(!algo.has_entry("42", Counter::Dislikes, &alice()).await.unwrap());
    }

    #[tokio::test]
    async fn every_view_counts() {
        let algo = AlgorithmService::new(GraphClient::local());
        for _ in 0..3 {
            algo.view("42").await.unwrap();
        }
        assert_eq!(algo.count("42", Counter::Views).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn watch_time_sums_latest_per_user() {
        let algo = AlgorithmService::new(GraphClient::local());
        algo.log_watch_time("42", &alice(), 30.0).await.unwrap();
        algo.log_watch_time("42", &alice(), 90.0).await.unwrap();
        algo.log_watch_time("42", &bob(), 30.0).await.unwrap();

        assert_eq!(algo.total_watch_time("42").await.unwrap(), 120.0);
        assert_eq!(algo.watch_time_of("42", &alice()).await.unwrap(), 90.0);
        assert_eq!(algo.watch_time_of("42", &Address::new("stars1nobody")).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn top_content_ranks_by_score() {
        let algo = AlgorithmService::new(GraphClient::local());

        algo.like("quiet", &alice()).await.unwrap();

        algo.view("popular").await.unwrap();
        algo.like("popular", &alice()).await.unwrap();
        algo.like("popular", &bob()).await.unwrap();
        algo.submit_feedback("popular", &bob(), "great intro").await.unwrap();

        algo.log_watch_time("long", &alice(), 600.0).await.unwrap();

        let ranked = algo.top_content().await.unwrap();
        let order: Vec<&str> = ranked.iter().map(|s| s.content_id.as_str()).collect();
        assert_eq!(order, vec!["long", "popular", "quiet"]);

        let popular = &ranked[1];
        assert_eq!(popular.likes, 2);
        assert_eq!(popular.views, 1);
        assert_eq!(popular.feedback, 1);
        assert_eq!(popular.score, 3.0);
        assert_eq!(ranked[0].score, 10.0);
    }
}
