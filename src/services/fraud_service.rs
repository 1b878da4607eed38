//! 欺诈风险评分服务
//!
//! 先读取全部风险信号，再按固定顺序对规则表求值。
//! 权重以百分点累加，最终截断到 100。

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    models::fraud::FraudAnalysis,
    repository::{DeviceRepository, IpBlacklistRepository, LoginAttemptRepository, Repositories},
    services::session_service::device_fingerprint,
};

/// 登录尝试信号的统计窗口（分钟）
pub const SIGNAL_WINDOW_MINUTES: i64 = 15;

/// 一次请求的风险信号
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskSignals {
    pub ip_blacklisted: bool,
    /// 窗口内该邮箱的失败登录次数
    pub failed_attempts_for_email: i64,
    /// 仅在已知用户 ID 时才可能为 true
    pub untrusted_device: bool,
    /// 窗口内该 IP 的登录尝试次数
    pub attempts_from_ip: i64,
}

/// 规则：谓词、权重（百分点）、因子描述
pub struct RiskRule {
    pub factor: &'static str,
    pub weight: u32,
    pub applies: fn(&RiskSignals) -> bool,
}

fn ip_blacklisted(s: &RiskSignals) -> bool {
    s.ip_blacklisted
}

fn many_failed_attempts(s: &RiskSignals) -> bool {
    s.failed_attempts_for_email >= 5
}

fn some_failed_attempts(s: &RiskSignals) -> bool {
    (3..5).contains(&s.failed_attempts_for_email)
}

fn untrusted_device(s: &RiskSignals) -> bool {
    s.untrusted_device
}

fn high_frequency(s: &RiskSignals) -> bool {
    s.attempts_from_ip >= 10
}

/// 固定顺序的规则表
pub static RISK_RULES: &[RiskRule] = &[
    RiskRule {
        factor: "IP address is blacklisted",
        weight: 80,
        applies: ip_blacklisted,
    },
    RiskRule {
        factor: "multiple failed attempts",
        weight: 60,
        applies: many_failed_attempts,
    },
    RiskRule {
        factor: "some failed attempts",
        weight: 30,
        applies: some_failed_attempts,
    },
    RiskRule {
        factor: "unknown device",
        weight: 20,
        applies: untrusted_device,
    },
    RiskRule {
        factor: "high frequency requests",
        weight: 40,
        applies: high_frequency,
    },
];

/// 对信号求值，纯函数
pub fn evaluate(signals: &RiskSignals) -> FraudAnalysis {
    let (points, factors) = RISK_RULES
        .iter()
        .filter(|rule| (rule.applies)(signals))
        .fold((0u32, Vec::new()), |(points, mut factors), rule| {
            factors.push(rule.factor.to_string());
            (points + rule.weight, factors)
        });

    FraudAnalysis::from_points(points, factors)
}

pub struct FraudService {
    blacklist: Arc<dyn IpBlacklistRepository>,
    attempts: Arc<dyn LoginAttemptRepository>,
    devices: Arc<dyn DeviceRepository>,
}

impl FraudService {
    pub fn new(repos: &Repositories) -> Self {
        Self {
            blacklist: repos.blacklist.clone(),
            attempts: repos.login_attempts.clone(),
            devices: repos.devices.clone(),
        }
    }

    /// 读取风险信号；读取失败的信号记 warn 日志并视为未触发
    pub async fn gather_signals(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        ip: &str,
        user_agent: &str,
    ) -> RiskSignals {
        let now = Utc::now();
        let since = now - Duration::minutes(SIGNAL_WINDOW_MINUTES);

        let ip_blacklisted = match self.blacklist.find_in_effect(ip, now).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                tracing::warn!(signal = "ip_blacklist", error = %e, "Risk signal unavailable");
                false
            }
        };

        let failed_attempts_for_email =
            match self.attempts.count_failed_by_email_since(email, since).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(signal = "failed_attempts", error = %e, "Risk signal unavailable");
                    0
                }
            };

        let untrusted_device = match user_id {
            Some(user_id) => {
                let fingerprint = device_fingerprint(ip, user_agent);
                match self.devices.find_device(user_id, &fingerprint).await {
                    Ok(device) => !device.is_some_and(|d| d.is_trusted),
                    Err(e) => {
                        tracing::warn!(signal = "device", error = %e, "Risk signal unavailable");
                        false
                    }
                }
            }
            None => false,
        };

        let attempts_from_ip = match self.attempts.count_by_ip_since(ip, since).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(signal = "ip_frequency", error = %e, "Risk signal unavailable");
                0
            }
        };

        RiskSignals {
            ip_blacklisted,
            failed_attempts_for_email,
            untrusted_device,
            attempts_from_ip,
        }
    }

    /// 计算单次请求的欺诈风险
    pub async fn analyze(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        ip: &str,
        user_agent: &str,
    ) -> FraudAnalysis {
        let signals = self.gather_signals(user_id, email, ip, user_agent).await;
        let analysis = evaluate(&signals);

        tracing::debug!(
            ip = %ip,
            score = analysis.risk_score,
            level = analysis.risk_level.as_str(),
            factors = ?analysis.factors,
            "Fraud analysis"
        );

        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fraud::RiskLevel;

    #[test]
    fn test_no_signals_is_low() {
        let analysis = evaluate(&RiskSignals::default());
        assert_eq!(analysis.risk_score, 0.0);
        assert_eq!(analysis.risk_level, RiskLevel::Low);
        assert!(analysis.factors.is_empty());
        assert_eq!(analysis.recommendation, "Allow request");
    }

    #[test]
    fn test_blacklisted_ip_is_high() {
        let analysis = evaluate(&RiskSignals {
            ip_blacklisted: true,
            ..RiskSignals::default()
        });
        assert_eq!(analysis.risk_score, 0.8);
        assert_eq!(analysis.risk_level, RiskLevel::High);
        assert_eq!(analysis.factors, vec!["IP address is blacklisted"]);
    }

    #[test]
    fn test_failed_attempt_tiers_are_exclusive() {
        let some = evaluate(&RiskSignals {
            failed_attempts_for_email: 3,
            ..RiskSignals::default()
        });
        assert_eq!(some.risk_score, 0.3);
        assert_eq!(some.factors, vec!["some failed attempts"]);

        let many = evaluate(&RiskSignals {
            failed_attempts_for_email: 5,
            ..RiskSignals::default()
        });
        assert_eq!(many.risk_score, 0.6);
        assert_eq!(many.risk_level, RiskLevel::Medium);
        assert_eq!(many.factors, vec!["multiple failed attempts"]);

        let few = evaluate(&RiskSignals {
            failed_attempts_for_email: 2,
            ..RiskSignals::default()
        });
        assert_eq!(few.risk_score, 0.0);
    }

    #[test]
    fn test_score_is_capped() {
        let analysis = evaluate(&RiskSignals {
            ip_blacklisted: true,
            failed_attempts_for_email: 10,
            untrusted_device: true,
            attempts_from_ip: 50,
        });
        assert_eq!(analysis.risk_score, 1.0);
        assert_eq!(
            analysis.factors,
            vec![
                "IP address is blacklisted",
                "multiple failed attempts",
                "unknown device",
                "high frequency requests",
            ]
        );
    }

    #[test]
    fn test_medium_band() {
        // 0.3 + 0.2 = 0.5
        let analysis = evaluate(&RiskSignals {
            failed_attempts_for_email: 4,
            untrusted_device: true,
            ..RiskSignals::default()
        });
        assert_eq!(analysis.risk_score, 0.5);
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_score_is_monotone_in_signals() {
        let mut all = Vec::new();
        for blacklisted in [false, true] {
            for failed in [0, 3, 5] {
                for device in [false, true] {
                    for from_ip in [0, 10] {
                        all.push(RiskSignals {
                            ip_blacklisted: blacklisted,
                            failed_attempts_for_email: failed,
                            untrusted_device: device,
                            attempts_from_ip: from_ip,
                        });
                    }
                }
            }
        }

        let dominates = |a: &RiskSignals, b: &RiskSignals| {
            a.ip_blacklisted >= b.ip_blacklisted
                && a.failed_attempts_for_email >= b.failed_attempts_for_email
                && a.untrusted_device >= b.untrusted_device
                && a.attempts_from_ip >= b.attempts_from_ip
        };

        for a in &all {
            let score_a = evaluate(a).risk_score;
            assert!((0.0..=1.0).contains(&score_a));
            for b in &all {
                if dominates(a, b) {
                    assert!(score_a >= evaluate(b).risk_score);
                }
            }
        }
    }
}
