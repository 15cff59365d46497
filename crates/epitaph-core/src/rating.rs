//! Weighted aggregation of numeric ratings from several sources.
//!
//! Each facet is normalized to 0–10 and weighted by a fixed source weight
//! times a vote-count confidence. The weighted mean is then shrunk toward a
//! prior so that thinly-voted titles do not dominate rankings.

use serde::{Deserialize, Serialize};

/// Prior mean used for Bayesian shrinkage.
pub const DEFAULT_PRIOR_MEAN: f64 = 6.5;

/// Confidence mass at which the raw score and the prior weigh equally.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.2;

/// Votes at which a facet is fully trusted.
const FULL_CONFIDENCE_VOTES: f64 = 10_000.0;

const FLOOR_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingScale {
    /// Already on 0–10.
    Decimal,
    /// 0–100, divided by 10.
    Percent,
}

/// One source's rating of a title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingInput {
    pub source: String,
    pub value: f64,
    pub scale: RatingScale,
    #[serde(default)]
    pub votes: Option<i64>,
    /// Overrides the default weight for `source`.
    #[serde(default)]
    pub weight: Option<f64>,
}

impl RatingInput {
    pub fn decimal(source: impl Into<String>, value: f64, votes: Option<i64>) -> Self {
        Self {
            source: source.into(),
            value,
            scale: RatingScale::Decimal,
            votes,
            weight: None,
        }
    }

    pub fn percent(source: impl Into<String>, value: f64, votes: Option<i64>) -> Self {
        Self {
            source: source.into(),
            value,
            scale: RatingScale::Percent,
            votes,
            weight: None,
        }
    }

    pub fn normalized(&self) -> f64 {
        let v = match self.scale {
            RatingScale::Decimal => self.value,
            RatingScale::Percent => self.value / 10.0,
        };
        v.clamp(0.0, 10.0)
    }

    fn weight(&self) -> f64 {
        self.weight
            .unwrap_or_else(|| default_weight(&self.source))
            .max(0.0)
    }
}

/// Built-in weight per rating source.
pub fn default_weight(source: &str) -> f64 {
    match source.to_lowercase().replace([' ', '-'], "_").as_str() {
        "imdb" => 0.25,
        "rotten_tomatoes_critics" | "rt_critics" => 0.20,
        "rotten_tomatoes_audience" | "rt_audience" => 0.10,
        "metacritic" => 0.20,
        "tmdb" => 0.15,
        "trakt" => 0.10,
        _ => 0.10,
    }
}

/// `clamp(votes / 10000, 0.1, 1.0)`; 0.1 when votes are unknown or not positive.
pub fn confidence_factor(votes: Option<i64>) -> f64 {
    match votes {
        Some(v) if v > 0 => (v as f64 / FULL_CONFIDENCE_VOTES).clamp(FLOOR_CONFIDENCE, 1.0),
        _ => FLOOR_CONFIDENCE,
    }
}

/// `c/(c+k)·raw + k/(c+k)·prior`. Equals the prior when `c = 0`.
pub fn bayesian_adjust(raw: f64, confidence: f64, prior: f64, k: f64) -> f64 {
    let c = confidence.max(0.0);
    if c + k <= 0.0 {
        return prior;
    }
    c / (c + k) * raw + k / (c + k) * prior
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOptions {
    pub prior_mean: f64,
    pub min_confidence: f64,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            prior_mean: DEFAULT_PRIOR_MEAN,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

/// Combined score at full precision. Use [`AggregateScore::rounded`] for
/// display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateScore {
    pub raw: f64,
    pub adjusted: f64,
    pub confidence: f64,
    /// Population standard deviation of the inputs; `None` below two.
    pub controversy: Option<f64>,
    pub contributors: usize,
}

impl AggregateScore {
    /// Every number rounded to two decimals.
    pub fn rounded(&self) -> Self {
        Self {
            raw: round2(self.raw),
            adjusted: round2(self.adjusted),
            confidence: round2(self.confidence),
            controversy: self.controversy.map(round2),
            contributors: self.contributors,
        }
    }
}

/// `None` when there is nothing to aggregate.
pub fn aggregate_ratings(
    inputs: &[RatingInput],
    options: &AggregateOptions,
) -> Option<AggregateScore> {
    let facets: Vec<(f64, f64, f64)> = inputs
        .iter()
        .filter(|i| i.value.is_finite())
        .map(|i| (i.normalized(), i.weight(), confidence_factor(i.votes)))
        .filter(|(_, w, _)| *w > 0.0)
        .collect();
    if facets.is_empty() {
        return None;
    }

    let weight_sum: f64 = facets.iter().map(|(_, w, _)| w).sum();
    let effective_sum: f64 = facets.iter().map(|(_, w, c)| w * c).sum();
    let raw = facets.iter().map(|(v, w, c)| v * w * c).sum::<f64>() / effective_sum;
    let confidence = (effective_sum / weight_sum).clamp(0.0, 1.0);
    let adjusted = bayesian_adjust(raw, confidence, options.prior_mean, options.min_confidence);

    let controversy = (facets.len() >= 2).then(|| {
        let n = facets.len() as f64;
        let mean = facets.iter().map(|(v, _, _)| v).sum::<f64>() / n;
        let variance = facets.iter().map(|(v, _, _)| (v - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt()
    });

    Some(AggregateScore {
        raw,
        adjusted,
        confidence,
        controversy,
        contributors: facets.len(),
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> AggregateOptions {
        AggregateOptions::default()
    }

    #[test]
    fn test_empty_input_is_none() {
        assert_eq!(aggregate_ratings(&[], &defaults()), None);
    }

    #[test]
    fn test_confidence_factor_is_monotone_and_saturates() {
        assert_eq!(confidence_factor(None), 0.1);
        assert_eq!(confidence_factor(Some(0)), 0.1);
        assert_eq!(confidence_factor(Some(-5)), 0.1);
        assert_eq!(confidence_factor(Some(500)), 0.1);
        assert_eq!(confidence_factor(Some(10_000)), 1.0);
        assert_eq!(confidence_factor(Some(2_000_000)), 1.0);
        let mut last = 0.0;
        for votes in [1, 100, 1_000, 2_500, 5_000, 9_999, 10_000, 50_000] {
            let c = confidence_factor(Some(votes));
            assert!(c >= last);
            last = c;
        }
    }

    #[test]
    fn test_adjusted_lies_between_raw_and_prior() {
        let prior = DEFAULT_PRIOR_MEAN;
        for (raw, c) in [(9.0, 0.5), (2.0, 0.1), (7.5, 1.0), (6.5, 0.3)] {
            let adjusted = bayesian_adjust(raw, c, prior, DEFAULT_MIN_CONFIDENCE);
            let (lo, hi) = if raw < prior { (raw, prior) } else { (prior, raw) };
            assert!(adjusted >= lo && adjusted <= hi, "{adjusted} not in [{lo}, {hi}]");
        }
        assert_eq!(bayesian_adjust(9.0, 0.0, prior, DEFAULT_MIN_CONFIDENCE), prior);
    }

    #[test]
    fn test_single_confident_input_keeps_its_value() {
        let score = aggregate_ratings(
            &[RatingInput::decimal("imdb", 7.8, Some(250_000))],
            &defaults(),
        )
        .unwrap()
        .rounded();
        assert_eq!(score.raw, 7.8);
        assert_eq!(score.confidence, 1.0);
        assert_eq!(score.controversy, None);
        assert_eq!(score.contributors, 1);
        // 1/1.2 * 7.8 + 0.2/1.2 * 6.5
        assert_eq!(score.adjusted, 7.58);
    }

    #[test]
    fn test_controversy() {
        let same = aggregate_ratings(
            &[
                RatingInput::decimal("imdb", 7.0, Some(10_000)),
                RatingInput::percent("metacritic", 70.0, Some(10_000)),
            ],
            &defaults(),
        )
        .unwrap();
        assert_eq!(same.controversy, Some(0.0));

        let differing = aggregate_ratings(
            &[
                RatingInput::decimal("imdb", 9.0, Some(10_000)),
                RatingInput::percent("metacritic", 40.0, Some(10_000)),
            ],
            &defaults(),
        )
        .unwrap();
        assert_eq!(differing.controversy, Some(2.5));

        let close = aggregate_ratings(
            &[
                RatingInput::decimal("imdb", 7.0, Some(10_000)),
                RatingInput::decimal("tmdb", 7.01, Some(10_000)),
            ],
            &defaults(),
        )
        .unwrap();
        let spread = close.controversy.unwrap();
        assert!(spread > 0.0);
        assert!((spread - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_scales_and_votes() {
        let score = aggregate_ratings(
            &[
                RatingInput::decimal("imdb", 8.0, Some(10_000)),
                RatingInput::percent("rotten_tomatoes_critics", 90.0, None),
            ],
            &defaults(),
        )
        .unwrap();
        assert_eq!(score.contributors, 2);
        assert!(score.raw > 8.0 && score.raw < 9.0, "raw = {}", score.raw);
        // (8*0.25 + 9*0.02) / 0.27
        assert_eq!(score.rounded().raw, 8.07);
    }

    #[test]
    fn test_weight_override_and_unknown_source() {
        assert_eq!(default_weight("Rotten Tomatoes Audience"), 0.10);
        assert_eq!(default_weight("letterboxd"), 0.10);
        let mut input = RatingInput::decimal("letterboxd", 5.0, Some(10_000));
        input.weight = Some(0.0);
        assert_eq!(aggregate_ratings(&[input], &defaults()), None);
    }
}
