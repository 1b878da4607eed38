//! 服务层集成测试（内存仓储）

use account_service::{
    error::AppError,
    middleware::AppState,
    models::{
        auth::LoginRequest,
        fraud::RiskLevel,
        security::{BlacklistIpRequest, NewBlacklistEntry, SecurityEventQuery},
    },
    services::TokenService,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

mod common;
use common::{
    client, create_test_app, create_test_config, create_test_state_with_store, register_request,
    register_user, FailingCounterStore, TEST_PASSWORD,
};

fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
    }
}

// ==================== Registration ====================

#[tokio::test]
async fn test_register_creates_single_credential_and_default_role() {
    let app = create_test_app();

    let user = app
        .state
        .auth_service
        .register(register_request("a@x.com", "secret"), &client("10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(user.email, "a@x.com");
    assert_eq!(user.age, 0);

    let credential = app
        .repos
        .credentials
        .find_credential_by_user(user.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credential.email, "a@x.com");
    assert!(credential.is_active);
    assert_ne!(credential.password_hash, "secret");

    let roles = app.repos.roles.role_names_for_user(user.id).await.unwrap();
    assert_eq!(roles, vec!["user"]);
}

#[tokio::test]
async fn test_register_duplicate_email_fails() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.0.1").await;

    let result = app
        .state
        .auth_service
        .register(register_request("  A@X.com ", "another"), &client("10.0.0.1"))
        .await;

    assert!(matches!(result, Err(AppError::AlreadyExists)));
}

#[tokio::test]
async fn test_register_rejects_weak_password_and_bad_input() {
    let app = create_test_app();
    let auth = &app.state.auth_service;
    let c = client("10.0.0.1");

    assert!(matches!(
        auth.register(register_request("weak@x.com", "12345"), &c).await,
        Err(AppError::WeakCredential(_))
    ));
    assert!(matches!(
        auth.register(register_request("", "secret"), &c).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        auth.register(register_request("not-an-email", "secret"), &c).await,
        Err(AppError::Validation(_))
    ));

    let mut too_old = register_request("old@x.com", "secret");
    too_old.age = Some(151);
    assert!(matches!(
        auth.register(too_old, &c).await,
        Err(AppError::Validation(_))
    ));

    // 弱密码在持久化之前被拒绝
    assert!(app
        .repos
        .credentials
        .find_credential_by_email("weak@x.com")
        .await
        .unwrap()
        .is_none());
}

// ==================== Login ====================

#[tokio::test]
async fn test_login_success_issues_tokens_and_session() {
    let app = create_test_app();
    let user = register_user(&app.state, "a@x.com", "10.0.0.2").await;

    let response = app
        .state
        .auth_service
        .login(login_request("A@X.COM", TEST_PASSWORD), &client("10.0.0.2"))
        .await
        .unwrap();

    assert_eq!(response.token_type, "Bearer");
    assert_eq!(response.expires_in, 300);
    assert_eq!(response.user.id, user.id);

    let claims = app
        .state
        .token_service
        .authenticate(&response.access_token)
        .await
        .unwrap();
    assert_eq!(claims.user_id().unwrap(), user.id);
    assert_eq!(claims.roles, vec!["user"]);

    let session = app
        .state
        .session_service
        .validate_session(&response.session_id)
        .await
        .unwrap();
    assert_eq!(session.user_id, user.id);

    let credential = app
        .repos
        .credentials
        .find_credential_by_user(user.id)
        .await
        .unwrap()
        .unwrap();
    assert!(credential.last_login_at.is_some());

    // 登录后设备被登记为未信任
    let devices = app.state.session_service.list_devices(user.id).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert!(!devices[0].is_trusted);
}

#[tokio::test]
async fn test_login_failures_are_uniform_and_recorded() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.0.3").await;
    let auth = &app.state.auth_service;
    let c = client("10.0.0.3");

    assert!(matches!(
        auth.login(login_request("a@x.com", "wrong-password"), &c).await,
        Err(AppError::InvalidCredentials)
    ));
    assert!(matches!(
        auth.login(login_request("nobody@x.com", TEST_PASSWORD), &c).await,
        Err(AppError::InvalidCredentials)
    ));

    let since = Utc::now() - Duration::minutes(5);
    let failed = app
        .repos
        .login_attempts
        .count_failed_by_email_since("a@x.com", since)
        .await
        .unwrap();
    assert_eq!(failed, 1);

    let from_ip = app
        .repos
        .login_attempts
        .count_by_ip_since("10.0.0.3", since)
        .await
        .unwrap();
    assert_eq!(from_ip, 2);
}

#[tokio::test]
async fn test_deactivated_account_cannot_login() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.0.4").await;
    let c = client("10.0.0.4");

    let login = app
        .state
        .auth_service
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();
    let claims = app
        .state
        .token_service
        .authenticate(&login.access_token)
        .await
        .unwrap();

    app.state
        .auth_service
        .deactivate_account(&claims, &c)
        .await
        .unwrap();

    assert!(matches!(
        app.state
            .auth_service
            .login(login_request("a@x.com", TEST_PASSWORD), &c)
            .await,
        Err(AppError::InvalidCredentials)
    ));
    assert!(matches!(
        app.state.token_service.authenticate(&login.access_token).await,
        Err(AppError::InvalidToken)
    ));
    assert!(matches!(
        app.state
            .session_service
            .validate_session(&login.session_id)
            .await,
        Err(AppError::InvalidSession)
    ));
    assert!(matches!(
        app.state.token_service.refresh(&login.refresh_token).await,
        Err(AppError::InvalidToken)
    ));
}

// ==================== Token Lifecycle ====================

#[tokio::test]
async fn test_refresh_rotation_is_single_use() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.0.5").await;
    let c = client("10.0.0.5");

    let login = app
        .state
        .auth_service
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();

    let rotated = app
        .state
        .auth_service
        .refresh(&login.refresh_token, &c)
        .await
        .unwrap();
    assert_ne!(rotated.refresh_token, login.refresh_token);

    assert!(matches!(
        app.state.auth_service.refresh(&login.refresh_token, &c).await,
        Err(AppError::InvalidToken)
    ));

    // 新令牌记录了被轮换的旧令牌
    let successor = app
        .repos
        .refresh_tokens
        .find_refresh_token_by_hash(&TokenService::hash_token(&rotated.refresh_token))
        .await
        .unwrap()
        .unwrap();
    let predecessor = app
        .repos
        .refresh_tokens
        .find_refresh_token_by_hash(&TokenService::hash_token(&login.refresh_token))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(successor.rotated_from, Some(predecessor.id));
    assert!(predecessor.revoked_at.is_some());

    assert!(app
        .state
        .auth_service
        .refresh(&rotated.refresh_token, &c)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_concurrent_refresh_yields_one_successor() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.0.6").await;

    let login = app
        .state
        .auth_service
        .login(login_request("a@x.com", TEST_PASSWORD), &client("10.0.0.6"))
        .await
        .unwrap();

    let token = Arc::new(login.refresh_token);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let tokens = app.state.token_service.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move { tokens.refresh(&token).await }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(matches!(e, AppError::InvalidToken)),
        }
    }

    assert_eq!(successes, 1);
}

#[tokio::test]
async fn test_unknown_refresh_token_rejected_and_audited() {
    let app = create_test_app();

    assert!(matches!(
        app.state
            .auth_service
            .refresh("deadbeef", &client("10.0.0.7"))
            .await,
        Err(AppError::InvalidToken)
    ));

    let events = app
        .repos
        .security_events
        .list_events(None, 10)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_type == "token_refresh_rejected"));
}

#[tokio::test]
async fn test_logout_revokes_access_refresh_and_session() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.0.8").await;
    let c = client("10.0.0.8");

    let login = app
        .state
        .auth_service
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();
    let claims = app
        .state
        .token_service
        .authenticate(&login.access_token)
        .await
        .unwrap();

    app.state
        .auth_service
        .logout(
            &claims,
            Some(&login.refresh_token),
            Some(&login.session_id),
            &c,
        )
        .await
        .unwrap();

    assert!(matches!(
        app.state.token_service.authenticate(&login.access_token).await,
        Err(AppError::InvalidToken)
    ));
    assert!(matches!(
        app.state.token_service.refresh(&login.refresh_token).await,
        Err(AppError::InvalidToken)
    ));
    assert!(matches!(
        app.state
            .session_service
            .validate_session(&login.session_id)
            .await,
        Err(AppError::InvalidSession)
    ));
}

// ==================== Password Change ====================

#[tokio::test]
async fn test_change_password_revokes_refresh_tokens() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.0.9").await;
    let c = client("10.0.0.9");
    let auth = &app.state.auth_service;

    let login = auth
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();
    let claims = app
        .state
        .token_service
        .authenticate(&login.access_token)
        .await
        .unwrap();

    assert!(matches!(
        auth.change_password(&claims, TEST_PASSWORD, "12345", &c).await,
        Err(AppError::WeakCredential(_))
    ));
    assert!(matches!(
        auth.change_password(&claims, "wrong-current", "new-secret", &c)
            .await,
        Err(AppError::InvalidCredentials)
    ));

    auth.change_password(&claims, TEST_PASSWORD, "new-secret", &c)
        .await
        .unwrap();

    assert!(matches!(
        auth.refresh(&login.refresh_token, &c).await,
        Err(AppError::InvalidToken)
    ));
    assert!(auth
        .login(login_request("a@x.com", "new-secret"), &c)
        .await
        .is_ok());
}

// ==================== Fraud Screening ====================

#[tokio::test]
async fn test_blacklisted_ip_scores_high() {
    let app = create_test_app();

    app.repos
        .blacklist
        .upsert_blacklist_entry(&NewBlacklistEntry {
            ip_address: "1.2.3.4".to_string(),
            reason: "abuse".to_string(),
            expires_at: None,
        })
        .await
        .unwrap();

    let fraud = account_service::services::FraudService::new(&app.repos);
    let analysis = fraud.analyze(None, "a@x.com", "1.2.3.4", "ua").await;

    assert!(analysis.risk_score >= 0.8);
    assert_eq!(analysis.risk_level, RiskLevel::High);
    assert!(analysis
        .factors
        .contains(&"IP address is blacklisted".to_string()));
}

#[tokio::test]
async fn test_high_risk_login_blocked_before_credential_check() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.1.1").await;

    // 只写仓储、不写缓存：由欺诈评分拦截
    app.repos
        .blacklist
        .upsert_blacklist_entry(&NewBlacklistEntry {
            ip_address: "1.2.3.4".to_string(),
            reason: "abuse".to_string(),
            expires_at: None,
        })
        .await
        .unwrap();

    let result = app
        .state
        .auth_service
        .login(login_request("a@x.com", TEST_PASSWORD), &client("1.2.3.4"))
        .await;
    assert!(matches!(result, Err(AppError::InvalidCredentials)));

    let register = app
        .state
        .auth_service
        .register(register_request("b@x.com", "secret"), &client("1.2.3.4"))
        .await;
    assert!(matches!(register, Err(AppError::Forbidden)));

    let events = app
        .state
        .admin_service
        .list_security_events(&SecurityEventQuery::default())
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == "fraud_blocked" && e.severity.as_str() == "HIGH"));

    let since = Utc::now() - Duration::minutes(5);
    assert_eq!(
        app.repos
            .login_attempts
            .count_failed_by_email_since("a@x.com", since)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_cached_blacklist_forbids() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.1.2").await;

    app.state
        .admin_service
        .blacklist_ip(
            Uuid::new_v4(),
            BlacklistIpRequest {
                ip_address: "5.5.5.5".to_string(),
                reason: "abuse".to_string(),
                expires_in_secs: Some(3600),
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        app.state
            .auth_service
            .login(login_request("a@x.com", TEST_PASSWORD), &client("5.5.5.5"))
            .await,
        Err(AppError::Forbidden)
    ));
}

#[tokio::test]
async fn test_repeated_failures_escalate_risk() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.2.1").await;
    let auth = &app.state.auth_service;
    let c = client("10.0.2.1");

    for _ in 0..3 {
        assert!(matches!(
            auth.login(login_request("a@x.com", "wrong-password"), &c).await,
            Err(AppError::InvalidCredentials)
        ));
    }

    // 3 次失败 + 未知设备 = MEDIUM，放行并记录
    let login = auth
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();
    assert_eq!(login.risk_level, RiskLevel::Medium);

    let events = app
        .repos
        .security_events
        .list_events(None, 100)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_type == "suspicious_activity"));

    for _ in 0..2 {
        let _ = auth.login(login_request("a@x.com", "wrong-password"), &c).await;
    }

    // 5 次失败 + 未知设备 = HIGH，正确密码也被拒绝
    assert!(matches!(
        auth.login(login_request("a@x.com", TEST_PASSWORD), &c).await,
        Err(AppError::InvalidCredentials)
    ));
}

#[tokio::test]
async fn test_trusted_device_lowers_risk() {
    let app = create_test_app();
    let user = register_user(&app.state, "a@x.com", "10.0.3.1").await;
    let c = client("10.0.3.1");
    let auth = &app.state.auth_service;

    let first = auth
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();
    assert_eq!(first.risk_level, RiskLevel::Low);

    let fingerprint = account_service::services::session_service::device_fingerprint(
        &c.ip,
        &c.user_agent,
    );
    let device = auth.trust_device(user.id, &fingerprint, &c).await.unwrap();
    assert!(device.is_trusted);

    for _ in 0..3 {
        let _ = auth.login(login_request("a@x.com", "wrong-password"), &c).await;
    }

    // 3 次失败但设备已信任 = 0.3，仍为 LOW
    let login = auth
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();
    assert_eq!(login.risk_level, RiskLevel::Low);
}

#[tokio::test]
async fn test_trust_device_of_other_user_forbidden() {
    let app = create_test_app();
    register_user(&app.state, "a@x.com", "10.0.4.1").await;
    let other = register_user(&app.state, "b@x.com", "10.0.4.1").await;
    let c = client("10.0.4.1");

    app.state
        .auth_service
        .login(login_request("a@x.com", TEST_PASSWORD), &c)
        .await
        .unwrap();

    let fingerprint = account_service::services::session_service::device_fingerprint(
        &c.ip,
        &c.user_agent,
    );
    assert!(matches!(
        app.state
            .auth_service
            .trust_device(other.id, &fingerprint, &c)
            .await,
        Err(AppError::Forbidden)
    ));
}

// ==================== Counter Store Outage ====================

async fn login_with_failing_store(fail_mode: &str) -> (Arc<AppState>, String) {
    let mut config = create_test_config();
    config.security.token_blacklist_fail_mode = fail_mode.to_string();
    let state = create_test_state_with_store(config, Arc::new(FailingCounterStore));

    register_user(&state, "a@x.com", "10.0.5.1").await;
    let login = state
        .auth_service
        .login(login_request("a@x.com", TEST_PASSWORD), &client("10.0.5.1"))
        .await
        .unwrap();

    (state, login.access_token)
}

#[tokio::test]
async fn test_token_blacklist_fails_closed() {
    let (state, access_token) = login_with_failing_store("closed").await;

    assert!(matches!(
        state.token_service.authenticate(&access_token).await,
        Err(AppError::InvalidToken)
    ));
}

#[tokio::test]
async fn test_token_blacklist_fails_open_when_configured() {
    let (state, access_token) = login_with_failing_store("open").await;

    assert!(state.token_service.authenticate(&access_token).await.is_ok());
}

#[tokio::test]
async fn test_rate_limiter_allows_when_store_down() {
    let state = create_test_state_with_store(create_test_config(), Arc::new(FailingCounterStore));

    for _ in 0..5 {
        let decision = state
            .rate_limiter
            .allow("ip:10.0.5.2", 1, std::time::Duration::from_secs(60))
            .await;
        assert!(decision.allowed);
    }
    assert!(!state.rate_limiter.check_blacklist("10.0.5.2").await);
}
