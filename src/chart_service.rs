//! Chart metadata lookups (§6.2): resolving a `chart_id` to the fields the
//! protocol engine needs to validate a `SelectChart` and to record a finished
//! play (§4.4).

use crate::room::PlayerScore;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct ChartInfo {
    pub id: i32,
    pub name: String,
    /// Charts marked unranked can still be played but never appear in
    /// federation room-catalog summaries.
    pub ranked: bool,
}

#[async_trait]
pub trait ChartService: Send + Sync {
    async fn lookup(&self, chart_id: i32) -> Result<ChartInfo, String>;

    /// Resolves a previously-submitted play record to its score, backing the
    /// `Played` command path (§4.4) — the alternative to a client submitting
    /// `GameResult` directly.
    async fn fetch_record(&self, record_id: i32) -> Result<PlayerScore, String>;
}

#[derive(Deserialize)]
struct ChartResponse {
    id: i32,
    name: String,
    ranked: bool,
}

#[derive(Deserialize)]
struct RecordResponse {
    score: i32,
    accuracy: f32,
    perfect: i32,
    good: i32,
    bad: i32,
    miss: i32,
    max_combo: i32,
}

pub struct HttpChartService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChartService {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl ChartService for HttpChartService {
    async fn lookup(&self, chart_id: i32) -> Result<ChartInfo, String> {
        let url = format!("{}/chart/{chart_id}", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("upstream returned {}", resp.status()));
        }
        let chart: ChartResponse = resp.json().await.map_err(|e| e.to_string())?;
        Ok(ChartInfo { id: chart.id, name: chart.name, ranked: chart.ranked })
    }

    async fn fetch_record(&self, record_id: i32) -> Result<PlayerScore, String> {
        let url = format!("{}/record/{record_id}", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("upstream returned {}", resp.status()));
        }
        let record: RecordResponse = resp.json().await.map_err(|e| e.to_string())?;
        Ok(PlayerScore {
            score: record.score,
            accuracy: record.accuracy,
            perfect: record.perfect,
            good: record.good,
            bad: record.bad,
            miss: record.miss,
            max_combo: record.max_combo,
            finish_time: chrono::Utc::now().timestamp_millis(),
        })
    }
}

/// Fixed-table chart service for tests.
#[derive(Default)]
pub struct StaticChartService {
    charts: std::sync::Mutex<std::collections::HashMap<i32, ChartInfo>>,
    records: std::sync::Mutex<std::collections::HashMap<i32, PlayerScore>>,
}

impl StaticChartService {
    #[must_use]
    pub fn with_chart(id: i32, name: &str) -> Self {
        let this = Self::default();
        this.charts.lock().unwrap().insert(
            id,
            ChartInfo { id, name: name.to_string(), ranked: true },
        );
        this
    }

    pub fn with_record(self, record_id: i32, score: PlayerScore) -> Self {
        self.records.lock().unwrap().insert(record_id, score);
        self
    }
}

#[async_trait]
impl ChartService for StaticChartService {
    async fn lookup(&self, chart_id: i32) -> Result<ChartInfo, String> {
        self.charts
            .lock()
            .unwrap()
            .get(&chart_id)
            .cloned()
            .ok_or_else(|| "chart not found".to_string())
    }

    async fn fetch_record(&self, record_id: i32) -> Result<PlayerScore, String> {
        self.records
            .lock()
            .unwrap()
            .get(&record_id)
            .copied()
            .ok_or_else(|| "record not found".to_string())
    }
}
