use crate::config::config::ScoringCfg;
use crate::core::error::CoreError;
use crate::core::types::SentimentReading;

/// Validates raw scores into the canonical [-1, 1] range.
///
/// Values slightly outside the range (within the configured tolerance) are
/// treated as float noise and clamped. Anything beyond the tolerance is an
/// upstream scoring defect and rejected without touching state.
pub struct ScoreNormalizer {
    tolerance: f64,
}

impl ScoreNormalizer {
    pub fn new(cfg: &ScoringCfg) -> Self {
        Self {
            tolerance: cfg.tolerance,
        }
    }

    pub fn normalize(
        &self,
        sector: &str,
        raw: f64,
        prompt_version: u32,
        ts_ms: i64,
    ) -> Result<SentimentReading, CoreError> {
        if !raw.is_finite() || raw.abs() > 1.0 + self.tolerance {
            return Err(CoreError::OutOfRangeInput {
                sector: sector.to_string(),
                value: raw,
            });
        }

        let score = raw.clamp(-1.0, 1.0);

        Ok(SentimentReading {
            sector: sector.to_string(),
            raw,
            score,
            prompt_version,
            ts_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::ScoringCfg;

    fn normalizer() -> ScoreNormalizer {
        ScoreNormalizer::new(&ScoringCfg::default())
    }

    #[test]
    fn passes_in_range_values_through() {
        let reading = normalizer().normalize("XLK", 0.42, 3, 1_000).unwrap();
        assert_eq!(reading.score, 0.42);
        assert_eq!(reading.raw, 0.42);
        assert_eq!(reading.prompt_version, 3);
    }

    #[test]
    fn clamps_float_noise() {
        // 1.03 is inside the 0.05 tolerance band
        let reading = normalizer().normalize("XLK", 1.03, 1, 0).unwrap();
        assert_eq!(reading.score, 1.0);
        assert_eq!(reading.raw, 1.03);

        let reading = normalizer().normalize("XLE", -1.049, 1, 0).unwrap();
        assert_eq!(reading.score, -1.0);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = normalizer().normalize("XLK", 1.2, 1, 0).unwrap_err();
        match err {
            CoreError::OutOfRangeInput { sector, value } => {
                assert_eq!(sector, "XLK");
                assert_eq!(value, 1.2);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(normalizer().normalize("XLK", -7.0, 1, 0).is_err());
        assert!(normalizer().normalize("XLK", f64::NAN, 1, 0).is_err());
    }
}
