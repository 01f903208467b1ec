//! Elo rating updates applied when a match ends

/// Score for one player of a finished match
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Win,
    Draw,
    Loss,
}

impl Score {
    fn value(self) -> f64 {
        match self {
            Score::Win => 1.0,
            Score::Draw => 0.5,
            Score::Loss => 0.0,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            Score::Win => Score::Loss,
            Score::Draw => Score::Draw,
            Score::Loss => Score::Win,
        }
    }
}

/// New rating for a player given both starting ratings
///
/// Standard Elo. Ratings come from `match_players.starting_rating`, so a
/// result recorded late still uses the ratings captured at pairing time.
pub fn updated_rating(rating: i64, opponent_rating: i64, score: Score, k: f64) -> i64 {
    let expected = expected_score(rating, opponent_rating);
    let delta = k * (score.value() - expected);
    rating + delta.round() as i64
}

fn expected_score(rating: i64, opponent_rating: i64) -> f64 {
    let diff = (opponent_rating - rating) as f64;
    1.0 / (1.0 + 10f64.powf(diff / 400.0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_equal_ratings_split_k() {
        assert_eq!(updated_rating(1500, 1500, Score::Win, 32.0), 1516);
        assert_eq!(updated_rating(1500, 1500, Score::Loss, 32.0), 1484);
        assert_eq!(updated_rating(1500, 1500, Score::Draw, 32.0), 1500);
    }

    #[test]
    fn test_upset_pays_more() {
        let underdog = updated_rating(1400, 1600, Score::Win, 32.0) - 1400;
        let favourite = updated_rating(1600, 1400, Score::Win, 32.0) - 1600;
        assert!(underdog > favourite);
    }

    #[test]
    fn test_zero_sum_at_equal_ratings() {
        let a = updated_rating(1500, 1500, Score::Win, 32.0) - 1500;
        let b = updated_rating(1500, 1500, Score::Loss, 32.0) - 1500;
        assert_eq!(a + b, 0);
    }
}
