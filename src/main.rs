//! 账户服务主入口

use account_service::{
    config::AppConfig,
    db,
    handlers::health,
    middleware::AppState,
    repository::Repositories,
    routes,
    store::{self, CounterStore, MemoryCounterStore, PgCounterStore},
    telemetry,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("account-service {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 按优先级加载：.env.<ACCOUNT_ENV> 或 .env.local > .env
    if let Ok(env) = std::env::var("ACCOUNT_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志
    telemetry::init_telemetry(&config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Account service starting...");

    // 3. 存储后端
    let (repos, db_pool) = if config.database.backend.eq_ignore_ascii_case("postgres") {
        let pool = db::create_pool(&config.database).await?;
        db::run_migrations(&pool).await?;
        (Repositories::postgres(pool.clone()), Some(pool))
    } else {
        tracing::warn!("Using in-memory repositories, data will not survive a restart");
        (Repositories::in_memory(), None)
    };

    // 4. 计数存储，连接失败时降级启动（限流放行）
    let counter_store: Arc<dyn CounterStore> = match (config.counter_store_backend(), &db_pool) {
        ("postgres", Some(pool)) => Arc::new(PgCounterStore::new(pool.clone())),
        _ => Arc::new(MemoryCounterStore::new()),
    };

    if config.counter_store_is_process_local() {
        tracing::warn!(
            "Counter store is in-process while the database is shared: rate limits and \
             token revocations are not visible to other instances"
        );
    }

    store::connect_with_retry(
        counter_store.as_ref(),
        config.counter_store.connect_retries,
        Duration::from_secs(config.counter_store.retry_interval_secs),
    )
    .await;

    // 5. 应用状态
    let app_state = Arc::new(AppState::new(
        config.clone(),
        repos,
        counter_store,
        db_pool,
    )?);

    if let Err(e) = app_state.admin_service.warm_blacklist_cache().await {
        tracing::warn!(error = %e, "Failed to warm IP blacklist cache");
    }

    spawn_cleanup_task(app_state.clone(), config.maintenance.cleanup_interval_secs);

    // 6. 路由与服务器
    let app = routes::create_router(app_state);

    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.server.graceful_shutdown_timeout_secs))
    .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 后台定期清理过期数据，间隔为 0 时不启动
fn spawn_cleanup_task(state: Arc<AppState>, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::info!("Background cleanup disabled");
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = state.session_service.cleanup_expired().await {
                tracing::error!(error = %e, "Background cleanup failed");
            }
        }
    });
}

/// 优雅关闭信号处理
///
/// 收到信号后开始优雅关闭，超时仍未结束则强制退出。
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

fn print_help() {
    println!("account-service {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: account-service [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 ACCOUNT_ 前缀的环境变量完成，例如");
    println!("  ACCOUNT_DATABASE__URL, ACCOUNT_SECURITY__JWT_SECRET");
}
