//! Fraud analysis result

use serde::{Deserialize, Serialize};

/// Risk level derived from the fraud score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// 分数以百分点表示: >= 80 HIGH, 50-79 MEDIUM, 其余 LOW
    pub fn from_points(points: u32) -> Self {
        match points {
            p if p >= 80 => RiskLevel::High,
            p if p >= 50 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Allow request",
            RiskLevel::Medium => "Monitor closely and consider step-up verification",
            RiskLevel::High => "Block request and require additional verification",
        }
    }
}

/// Per-request fraud analysis; computed fresh, never persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FraudAnalysis {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub factors: Vec<String>,
    pub recommendation: String,
}

impl FraudAnalysis {
    /// Build from a sum of rule weights in hundredths, clamped to 100
    pub fn from_points(points: u32, factors: Vec<String>) -> Self {
        let points = points.min(100);
        let level = RiskLevel::from_points(points);

        Self {
            risk_score: f64::from(points) / 100.0,
            risk_level: level,
            factors,
            recommendation: level.recommendation().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_boundaries() {
        assert_eq!(RiskLevel::from_points(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_points(49), RiskLevel::Low);
        assert_eq!(RiskLevel::from_points(50), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_points(79), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_points(80), RiskLevel::High);
        assert_eq!(RiskLevel::from_points(100), RiskLevel::High);
    }

    #[test]
    fn test_score_clamped() {
        let analysis = FraudAnalysis::from_points(200, vec![]);
        assert_eq!(analysis.risk_score, 1.0);
        assert_eq!(analysis.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&RiskLevel::High).unwrap(), "\"HIGH\"");
    }
}
