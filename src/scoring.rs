use crate::model::LocationSource;

pub const BASE_CONFIDENCE: f64 = 0.70;
pub const PROVIDER_CONFIDENCE_CAP: f64 = 0.95;
pub const USER_FORM_CONFIDENCE: f64 = 0.90;
pub const MISMATCH_PENALTY: f64 = 0.2;

const POSTAL_CODE_BONUS: f64 = 0.10;
const HOUSE_NUMBER_BONUS: f64 = 0.10;
const POINT_OF_INTEREST_BONUS: f64 = 0.05;

/// Address completeness signals extracted from a provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressQuality {
    pub has_postal_code: bool,
    pub has_house_number: bool,
    pub is_point_of_interest: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    pub fn score_provider(&self, quality: AddressQuality) -> f64 {
        let mut score = BASE_CONFIDENCE;
        if quality.has_postal_code {
            score += POSTAL_CODE_BONUS;
        }
        if quality.has_house_number {
            score += HOUSE_NUMBER_BONUS;
        }
        if quality.is_point_of_interest {
            score += POINT_OF_INTEREST_BONUS;
        }
        score.clamp(0.0, PROVIDER_CONFIDENCE_CAP)
    }

    /// Confidence recorded for a save, before cross-validation.
    ///
    /// `provider_score` is the confidence attached to the candidate or to the
    /// lookup that produced the coordinates, if any.
    pub fn score_save(&self, source: LocationSource, provider_score: Option<f64>) -> f64 {
        match source {
            LocationSource::UserForm => USER_FORM_CONFIDENCE,
            LocationSource::Exif => BASE_CONFIDENCE,
            LocationSource::SearchSelection | LocationSource::ReverseGeocode => provider_score
                .map(|score| clamp_provider(score))
                .unwrap_or(BASE_CONFIDENCE),
        }
    }

    pub fn apply_mismatch_penalty(&self, confidence: f64) -> f64 {
        clamp_unit(confidence - MISMATCH_PENALTY)
    }
}

pub fn clamp_provider(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, PROVIDER_CONFIDENCE_CAP)
}

pub fn clamp_unit(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn base_and_bonuses() {
        let scorer = ConfidenceScorer;
        assert!(approx(scorer.score_provider(AddressQuality::default()), 0.70));
        assert!(approx(
            scorer.score_provider(AddressQuality {
                has_postal_code: true,
                ..Default::default()
            }),
            0.80
        ));
        assert!(approx(
            scorer.score_provider(AddressQuality {
                is_point_of_interest: true,
                ..Default::default()
            }),
            0.75
        ));
    }

    #[test]
    fn never_exceeds_provider_cap() {
        let scorer = ConfidenceScorer;
        let full = scorer.score_provider(AddressQuality {
            has_postal_code: true,
            has_house_number: true,
            is_point_of_interest: true,
        });
        assert!(approx(full, PROVIDER_CONFIDENCE_CAP));
        assert!(approx(
            scorer.score_save(LocationSource::SearchSelection, Some(1.7)),
            PROVIDER_CONFIDENCE_CAP
        ));
    }

    #[test]
    fn complete_address_scores_at_least_bare_one() {
        let scorer = ConfidenceScorer;
        for poi in [false, true] {
            let bare = scorer.score_provider(AddressQuality {
                is_point_of_interest: poi,
                ..Default::default()
            });
            let complete = scorer.score_provider(AddressQuality {
                has_postal_code: true,
                has_house_number: true,
                is_point_of_interest: poi,
            });
            assert!(complete >= bare);
        }
    }

    #[test]
    fn user_edits_are_fixed() {
        let scorer = ConfidenceScorer;
        assert!(approx(
            scorer.score_save(LocationSource::UserForm, Some(0.2)),
            USER_FORM_CONFIDENCE
        ));
        assert!(approx(scorer.score_save(LocationSource::Exif, None), 0.70));
    }

    #[test]
    fn penalty_never_goes_negative() {
        let scorer = ConfidenceScorer;
        assert!(approx(scorer.apply_mismatch_penalty(0.9), 0.7));
        assert!(approx(scorer.apply_mismatch_penalty(0.1), 0.0));
    }
}
