//! Attach reviewer quality scores to catalog entries.

use log::info;

use crate::catalog::{push_bounded, QualityScore, ScoreRecord, SCORE_HISTORY_CAP};
use crate::error::{CatalogError, Result};
use crate::store::{CatalogStore, LoadPolicy};

/// Set `key`'s score and append it to the score history.
pub fn record_score(store: &CatalogStore, key: &str, score: QualityScore) -> Result<()> {
    store.update(LoadPolicy::Strict, |catalog| {
        let entry = catalog.items.get_mut(key).ok_or_else(|| CatalogError::UnknownKey(key.to_string()))?;
        let record = ScoreRecord {
            at: score.scored_at,
            key: key.to_string(),
            visual: score.visual,
            audio: score.audio,
            scorer: score.scorer.clone(),
        };
        entry.score = Some(score);
        push_bounded(&mut catalog.meta_info.score_history, record, SCORE_HISTORY_CAP);
        Ok(())
    })?;
    info!("Recorded score for {}", key);
    Ok(())
}
