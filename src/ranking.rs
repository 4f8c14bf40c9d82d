#![forbid(unsafe_code)]

//! Feed ranking: a satisfaction score blending personalization, search
//! intent, and engagement, followed by a channel-diversity pass. Pure and
//! deterministic; callers inject the clock so results are reproducible.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::categories::CATEGORIES;

const HISTORY_WINDOW: usize = 50;
const QUERY_WINDOW: usize = 10;
const SEVEN_DAYS_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const THIRTY_DAYS_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Assumed length when a watched video's real duration is unknown.
const DEFAULT_VIDEO_LENGTH_SECS: f64 = 300.0;

/// A video under consideration for the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCandidate {
    pub id: String,
    #[serde(default)]
    pub channel_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub length_seconds: u64,
    /// Publish time as epoch seconds; 0 means unknown.
    #[serde(default)]
    pub published: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub video_id: String,
    pub watched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteCreator {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHistoryEntry {
    pub query: String,
    #[serde(default)]
    pub searched_at: Option<DateTime<Utc>>,
}

/// Everything the scorer knows about the user. All collections default to
/// empty so a cold-start request can send `{}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSignals {
    #[serde(default)]
    pub favorite_creators: Vec<FavoriteCreator>,
    /// Most recent first; only the first 50 entries are consulted.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Video id -> resume position in seconds.
    #[serde(default)]
    pub playback_positions: HashMap<String, f64>,
    /// Most recent first; the first 10 queries drive intent matching.
    #[serde(default)]
    pub search_history: Vec<SearchHistoryEntry>,
    /// Legacy position map consulted when `playback_positions` misses.
    #[serde(default)]
    pub watch_time: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiversityConstraints {
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive_same_channel: usize,
}

fn default_max_consecutive() -> usize {
    2
}

impl Default for DiversityConstraints {
    fn default() -> Self {
        Self {
            max_consecutive_same_channel: default_max_consecutive(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RankOptions {
    /// Watched video id -> channel id, for channel affinity over history.
    pub history_channels: HashMap<String, String>,
    /// Watched video id -> length in seconds, for retention over history.
    pub video_lengths: HashMap<String, f64>,
    pub diversity: DiversityConstraints,
    /// Fixed clock for scoring; `None` samples `Utc::now()` once.
    pub now: Option<DateTime<Utc>>,
}

/// A candidate with its component scores and blended final score.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredVideo {
    #[serde(flatten)]
    pub video: VideoCandidate,
    pub personalization: f64,
    pub intent: f64,
    pub engagement: f64,
    pub score: f64,
}

/// Watch counts per channel over the recent history window.
pub fn channel_watch_counts(
    history: &[HistoryEntry],
    history_channels: &HashMap<String, String>,
) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for entry in history.iter().take(HISTORY_WINDOW) {
        if let Some(channel) = history_channels.get(&entry.video_id) {
            *counts.entry(channel.clone()).or_insert(0) += 1;
        }
    }
    counts
}

fn watch_retention(
    channel_id: &str,
    signals: &UserSignals,
    history_channels: &HashMap<String, String>,
    video_lengths: &HashMap<String, f64>,
) -> f64 {
    let mut sum = 0.0;
    let mut samples = 0u32;
    for entry in signals.history.iter().take(HISTORY_WINDOW) {
        if history_channels.get(&entry.video_id).map(String::as_str) != Some(channel_id) {
            continue;
        }
        let position = signals
            .playback_positions
            .get(&entry.video_id)
            .or_else(|| signals.watch_time.get(&entry.video_id))
            .copied()
            .unwrap_or(0.0);
        let length = video_lengths
            .get(&entry.video_id)
            .copied()
            .unwrap_or(DEFAULT_VIDEO_LENGTH_SECS);
        if length > 0.0 && position > 0.0 {
            sum += (position / length).min(1.0);
            samples += 1;
        }
    }
    if samples == 0 {
        0.0
    } else {
        (sum / f64::from(samples)).min(1.0)
    }
}

fn channel_recency(
    channel_id: &str,
    signals: &UserSignals,
    history_channels: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> f64 {
    let mut recent = 0u32;
    for entry in signals.history.iter().take(HISTORY_WINDOW) {
        if history_channels.get(&entry.video_id).map(String::as_str) != Some(channel_id) {
            continue;
        }
        if now.timestamp_millis() - entry.watched_at.timestamp_millis() < SEVEN_DAYS_MS {
            recent += 1;
        }
    }
    (f64::from(recent) / 3.0).min(1.0)
}

/// Personalization (0..=1): channel affinity, favorite-creator flag,
/// same-channel watch retention, and 7-day channel recency.
pub fn personalization_score(
    video: &VideoCandidate,
    signals: &UserSignals,
    watch_counts: &HashMap<String, usize>,
    history_channels: &HashMap<String, String>,
    video_lengths: &HashMap<String, f64>,
    now: DateTime<Utc>,
) -> f64 {
    if video.channel_id.is_empty() {
        return 0.0;
    }

    let count = watch_counts.get(&video.channel_id).copied().unwrap_or(0);
    let affinity = (count as f64 / 10.0).min(1.0);

    let favorite = if signals
        .favorite_creators
        .iter()
        .any(|creator| creator.id == video.channel_id)
    {
        1.0
    } else {
        0.0
    };

    let retention = watch_retention(&video.channel_id, signals, history_channels, video_lengths);
    let recency = channel_recency(&video.channel_id, signals, history_channels, now);

    0.4 * affinity + 0.3 * favorite + 0.2 * retention + 0.1 * recency
}

/// Lowercased tokens split on non-alphanumeric characters.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect()
}

/// Best token-overlap (Jaccard) between the recent queries and the text,
/// scaled up so a solid partial match still registers.
fn query_match(queries: &[&str], text: &str) -> f64 {
    let text_tokens = tokenize(text);
    let mut best = 0.0f64;
    for query in queries.iter().take(QUERY_WINDOW) {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            continue;
        }
        let overlap = query_tokens.intersection(&text_tokens).count();
        let denominator = (query_tokens.len() + text_tokens.len() - overlap).max(1);
        best = best.max(overlap as f64 / denominator as f64);
    }
    (best * 2.0).min(1.0)
}

fn category_match(queries: &[&str], video: &VideoCandidate) -> f64 {
    let haystack = format!(
        "{} {}",
        video.title,
        video.description.as_deref().unwrap_or("")
    )
    .to_lowercase();

    for category in CATEGORIES {
        if category.slug == "all" {
            continue;
        }
        let query_matches = queries.iter().any(|query| {
            let query = query.to_lowercase();
            category
                .keywords
                .iter()
                .any(|keyword| query.contains(keyword) || keyword.contains(query.as_str()))
        });
        if !query_matches {
            continue;
        }
        if category
            .keywords
            .iter()
            .any(|keyword| haystack.contains(keyword))
        {
            return 1.0;
        }
    }
    0.0
}

/// Search intent (0..=1): how well the video matches what the user has
/// recently been searching for.
pub fn intent_score(video: &VideoCandidate, search_history: &[SearchHistoryEntry]) -> f64 {
    let queries: Vec<&str> = search_history
        .iter()
        .map(|entry| entry.query.as_str())
        .collect();
    if queries.is_empty() {
        return 0.0;
    }

    let title = query_match(&queries, &video.title);
    let description = video
        .description
        .as_deref()
        .filter(|text| !text.is_empty())
        .map(|text| query_match(&queries, text))
        .unwrap_or(0.0);
    let category = category_match(&queries, video);

    0.6 * title + 0.2 * description + 0.2 * category
}

/// Engagement (0..=1): audience size, the user's own retention on this
/// exact video, and publish freshness.
pub fn engagement_score(video: &VideoCandidate, signals: &UserSignals, now: DateTime<Utc>) -> f64 {
    let views = ((video.view_count as f64 + 1.0).log10() / 8.0).min(1.0);

    // `published` arrives from clients as well as mirrors; the age is
    // computed in floats so extreme values cannot overflow.
    let age_ms = now.timestamp_millis() as f64 - video.published as f64 * 1000.0;
    let freshness = if age_ms < THIRTY_DAYS_MS as f64 {
        0.5 + 0.5 * (1.0 - age_ms / THIRTY_DAYS_MS as f64)
    } else {
        0.5
    };

    let mut retention = 0.0;
    let position = signals
        .playback_positions
        .get(&video.id)
        .or_else(|| signals.watch_time.get(&video.id))
        .copied();
    let length = if video.length_seconds == 0 {
        1.0
    } else {
        video.length_seconds as f64
    };
    if let Some(position) = position
        && position > 0.0
    {
        retention = (position / length).min(1.0);
    }

    0.5 * views + 0.3 * retention + 0.2 * freshness.min(1.0)
}

/// Scores every candidate, sorts by final score descending (stable, so
/// ties keep input order), then spaces out same-channel runs. The result
/// is always a permutation of the input.
pub fn rank_videos(
    candidates: &[VideoCandidate],
    signals: &UserSignals,
    options: &RankOptions,
) -> Vec<ScoredVideo> {
    let now = options.now.unwrap_or_else(Utc::now);
    let watch_counts = channel_watch_counts(&signals.history, &options.history_channels);

    let has_history = !signals.history.is_empty();
    let (alpha, beta, gamma) = if has_history {
        (0.5, 0.25, 0.25)
    } else {
        // Cold start: nothing to personalize, let engagement carry the feed.
        (0.0, 0.3, 0.7)
    };

    let mut scored: Vec<ScoredVideo> = candidates
        .iter()
        .map(|video| {
            let personalization = personalization_score(
                video,
                signals,
                &watch_counts,
                &options.history_channels,
                &options.video_lengths,
                now,
            );
            let intent = intent_score(video, &signals.search_history);
            let engagement = engagement_score(video, signals, now);
            ScoredVideo {
                video: video.clone(),
                personalization,
                intent,
                engagement,
                score: alpha * personalization + beta * intent + gamma * engagement,
            }
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    apply_diversity(scored, &options.diversity, |item| {
        item.video.channel_id.as_str()
    })
}

/// Greedy spacing pass: when the head of the queue would extend a
/// same-channel run past the limit, the nearest different-channel
/// candidate is promoted instead. Nothing is ever dropped; if only one
/// channel remains the tail may exceed the limit.
pub fn apply_diversity<T>(
    candidates: Vec<T>,
    constraints: &DiversityConstraints,
    channel_of: impl Fn(&T) -> &str,
) -> Vec<T> {
    let max_consecutive = constraints.max_consecutive_same_channel;
    let mut remaining: VecDeque<T> = candidates.into();
    let mut result: Vec<T> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let channel = channel_of(&remaining[0]).to_string();
        let window_start = result.len().saturating_sub(max_consecutive);
        let run = result[window_start..]
            .iter()
            .filter(|item| channel_of(item) == channel)
            .count();

        let pick = if run >= max_consecutive {
            remaining
                .iter()
                .position(|item| channel_of(item) != channel)
                .unwrap_or(0)
        } else {
            0
        };
        if let Some(item) = remaining.remove(pick) {
            result.push(item);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn video(id: &str, channel: &str) -> VideoCandidate {
        VideoCandidate {
            id: id.into(),
            channel_id: channel.into(),
            title: format!("Video {id}"),
            description: None,
            view_count: 1000,
            length_seconds: 300,
            published: 0,
        }
    }

    fn history_entry(video_id: &str, days_ago: i64) -> HistoryEntry {
        HistoryEntry {
            video_id: video_id.into(),
            watched_at: fixed_now() - chrono::Duration::days(days_ago),
        }
    }

    fn search_entry(query: &str) -> SearchHistoryEntry {
        SearchHistoryEntry {
            query: query.into(),
            searched_at: None,
        }
    }

    #[test]
    fn query_match_scales_jaccard_overlap() {
        // {rust, tutorial} vs {rust, tutorial, for, beginners}:
        // overlap 2, union 4, jaccard 0.5, doubled and capped to 1.
        let score = query_match(&["rust tutorial"], "Rust Tutorial for Beginners");
        assert!((score - 1.0).abs() < 1e-9);

        // {cooking} vs the same title: no overlap at all.
        assert_eq!(query_match(&["cooking"], "Rust Tutorial for Beginners"), 0.0);

        // Single shared token out of five: 2 * 1/5.
        let partial = query_match(&["rust"], "rust one two three four");
        assert!((partial - 0.4).abs() < 1e-9);
    }

    #[test]
    fn intent_score_uses_category_keywords() {
        let mut gaming = video("g1", "ch-a");
        gaming.title = "Best video games of the year".into();
        let unrelated = video("u1", "ch-b");

        let searches = vec![search_entry("gaming")];
        let gaming_score = intent_score(&gaming, &searches);
        let unrelated_score = intent_score(&unrelated, &searches);
        assert!(gaming_score > unrelated_score);
        // Category component alone contributes 0.2.
        assert!(gaming_score >= 0.2);
    }

    #[test]
    fn intent_score_empty_history_is_zero() {
        assert_eq!(intent_score(&video("v", "c"), &[]), 0.0);
    }

    #[test]
    fn personalization_affinity_saturates_at_ten_watches() {
        let candidate = video("v1", "ch-a");
        let mut signals = UserSignals::default();
        let mut history_channels = HashMap::new();
        for i in 0..20 {
            let id = format!("w{i}");
            signals.history.push(history_entry(&id, 100));
            history_channels.insert(id, "ch-a".to_string());
        }
        let counts = channel_watch_counts(&signals.history, &history_channels);
        assert_eq!(counts.get("ch-a"), Some(&20));

        let score = personalization_score(
            &candidate,
            &signals,
            &counts,
            &history_channels,
            &HashMap::new(),
            fixed_now(),
        );
        // Affinity capped at 1.0, nothing else contributes (old watches,
        // no positions, not a favorite).
        assert!((score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn personalization_counts_recent_watches() {
        let candidate = video("v1", "ch-a");
        let mut signals = UserSignals::default();
        let mut history_channels = HashMap::new();
        for (i, days) in [1i64, 2, 3].iter().enumerate() {
            let id = format!("w{i}");
            signals.history.push(history_entry(&id, *days));
            history_channels.insert(id, "ch-a".to_string());
        }
        let counts = channel_watch_counts(&signals.history, &history_channels);
        let score = personalization_score(
            &candidate,
            &signals,
            &counts,
            &history_channels,
            &HashMap::new(),
            fixed_now(),
        );
        // affinity 3/10 -> 0.12, recency capped at 3/3 -> 0.1.
        assert!((score - (0.4 * 0.3 + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn personalization_blank_channel_is_zero() {
        let candidate = video("v1", "");
        let score = personalization_score(
            &candidate,
            &UserSignals::default(),
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            fixed_now(),
        );
        assert_eq!(score, 0.0);
    }

    #[test]
    fn retention_averages_same_channel_positions() {
        let mut signals = UserSignals::default();
        let mut history_channels = HashMap::new();
        let mut video_lengths = HashMap::new();
        for (id, position, length) in [("a", 50.0, 100.0), ("b", 100.0, 100.0)] {
            signals.history.push(history_entry(id, 50));
            signals.playback_positions.insert(id.to_string(), position);
            history_channels.insert(id.to_string(), "ch-a".to_string());
            video_lengths.insert(id.to_string(), length);
        }
        let retention = watch_retention("ch-a", &signals, &history_channels, &video_lengths);
        assert!((retention - 0.75).abs() < 1e-9);
    }

    #[test]
    fn engagement_view_count_saturates() {
        let mut signals = UserSignals::default();
        let mut popular = video("p", "ch");
        popular.view_count = 100_000_000;
        popular.published = 0;
        let score = engagement_score(&popular, &signals, fixed_now());
        // log10(1e8)/8 = 1.0 -> 0.5, plus the 0.5-baseline freshness term.
        assert!((score - (0.5 + 0.2 * 0.5)).abs() < 1e-6);

        signals
            .playback_positions
            .insert("p".to_string(), 150.0);
        let with_retention = engagement_score(&popular, &signals, fixed_now());
        assert!((with_retention - (0.5 + 0.3 * 0.5 + 0.2 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn engagement_prefers_fresh_uploads() {
        let now = fixed_now();
        let mut fresh = video("f", "ch");
        fresh.published = now.timestamp();
        let mut stale = video("s", "ch");
        stale.published = 0;

        let signals = UserSignals::default();
        assert!(engagement_score(&fresh, &signals, now) > engagement_score(&stale, &signals, now));
    }

    #[test]
    fn engagement_tolerates_extreme_published_values() {
        let signals = UserSignals::default();
        let mut far_future = video("f", "ch");
        far_future.published = i64::MAX;
        let mut far_past = video("p", "ch");
        far_past.published = i64::MIN;

        let future_score = engagement_score(&far_future, &signals, fixed_now());
        let past_score = engagement_score(&far_past, &signals, fixed_now());
        assert!(future_score.is_finite() && (0.0..=1.0).contains(&future_score));
        assert!(past_score.is_finite() && (0.0..=1.0).contains(&past_score));
    }

    #[test]
    fn rank_is_permutation_sorted_descending() {
        let candidates: Vec<VideoCandidate> = (0..6)
            .map(|i| {
                let mut v = video(&format!("v{i}"), &format!("ch{i}"));
                v.view_count = 10u64.pow(i);
                v
            })
            .collect();
        let ranked = rank_videos(&candidates, &UserSignals::default(), &RankOptions {
            now: Some(fixed_now()),
            ..RankOptions::default()
        });

        assert_eq!(ranked.len(), candidates.len());
        let mut input_ids: Vec<&str> = candidates.iter().map(|v| v.id.as_str()).collect();
        let mut output_ids: Vec<&str> = ranked.iter().map(|s| s.video.id.as_str()).collect();
        input_ids.sort_unstable();
        output_ids.sort_unstable();
        assert_eq!(input_ids, output_ids);

        // Distinct channels, so diversity leaves the descending order alone.
        for window in ranked.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
        assert_eq!(ranked[0].video.id, "v5");
    }

    #[test]
    fn cold_start_is_engagement_driven() {
        let mut popular = video("pop", "ch-a");
        popular.view_count = 50_000_000;
        let mut obscure = video("obs", "ch-b");
        obscure.view_count = 10;

        let ranked = rank_videos(&[obscure, popular], &UserSignals::default(), &RankOptions {
            now: Some(fixed_now()),
            ..RankOptions::default()
        });
        for item in &ranked {
            assert_eq!(item.personalization, 0.0);
        }
        assert_eq!(ranked[0].video.id, "pop");
    }

    #[test]
    fn favorite_creator_outranks_equal_video() {
        let a = video("a", "ch-a");
        let b = video("b", "ch-b");
        let mut signals = UserSignals::default();
        // Any history entry switches the blend to the personalized weights.
        signals.history.push(history_entry("x", 1));
        signals.favorite_creators.push(FavoriteCreator {
            id: "ch-b".into(),
            name: "B".into(),
            avatar: None,
        });

        let ranked = rank_videos(&[a, b], &signals, &RankOptions {
            now: Some(fixed_now()),
            ..RankOptions::default()
        });
        assert_eq!(ranked[0].video.id, "b");
    }

    #[test]
    fn diversity_limits_consecutive_channel_runs() {
        // Six videos from channel A that all outscore two from channel B.
        let mut candidates = Vec::new();
        for i in 0..6 {
            let mut v = video(&format!("a{i}"), "ch-a");
            v.view_count = 1_000_000;
            candidates.push(v);
        }
        for i in 0..2 {
            let mut v = video(&format!("b{i}"), "ch-b");
            v.view_count = 10;
            candidates.push(v);
        }

        let ranked = rank_videos(&candidates, &UserSignals::default(), &RankOptions {
            now: Some(fixed_now()),
            ..RankOptions::default()
        });
        assert_eq!(ranked.len(), 8);

        let channels: Vec<&str> = ranked.iter().map(|s| s.video.channel_id.as_str()).collect();
        assert_eq!(
            channels,
            vec!["ch-a", "ch-a", "ch-b", "ch-a", "ch-a", "ch-b", "ch-a", "ch-a"]
        );
        for window in channels.windows(3) {
            assert!(
                !(window[0] == window[1] && window[1] == window[2]),
                "run of three from {}",
                window[0]
            );
        }
    }

    #[test]
    fn diversity_single_channel_passes_through() {
        let items: Vec<VideoCandidate> = (0..4).map(|i| video(&format!("v{i}"), "only")).collect();
        let ordered = apply_diversity(items.clone(), &DiversityConstraints::default(), |v| {
            v.channel_id.as_str()
        });
        let ids: Vec<&str> = ordered.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["v0", "v1", "v2", "v3"]);
    }

    #[test]
    fn diversity_empty_input() {
        let ordered = apply_diversity(
            Vec::<VideoCandidate>::new(),
            &DiversityConstraints::default(),
            |v| v.channel_id.as_str(),
        );
        assert!(ordered.is_empty());
    }

    #[test]
    fn signals_deserialize_from_minimal_json() {
        let signals: UserSignals = serde_json::from_str("{}").unwrap();
        assert!(signals.history.is_empty());
        assert!(signals.favorite_creators.is_empty());

        let signals: UserSignals = serde_json::from_str(
            r#"{
                "favoriteCreators": [{"id": "UCx", "name": "X"}],
                "history": [{"videoId": "v1", "watchedAt": "2026-02-20T10:00:00Z"}],
                "playbackPositions": {"v1": 42.5},
                "searchHistory": [{"query": "lofi beats", "searchedAt": "2026-02-21T08:00:00Z"}],
                "watchTime": {}
            }"#,
        )
        .unwrap();
        assert_eq!(signals.favorite_creators[0].id, "UCx");
        assert_eq!(signals.history[0].video_id, "v1");
        assert_eq!(signals.playback_positions["v1"], 42.5);
        assert_eq!(signals.search_history[0].query, "lofi beats");
    }
}
