use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_cover_every_section() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert!(settings.database.url.is_none());
    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.backend, BackendKind::Memory);
    assert_eq!(settings.cache.posts_ttl, Duration::from_secs(300));
    assert_eq!(settings.cache.tags_ttl, Duration::from_secs(3600));
    assert_eq!(settings.cache.comments_ttl, Duration::from_secs(600));
    assert_eq!(settings.heat, HeatWeights::default());
    assert_eq!(settings.broadcast.backlog_capacity.get(), 100);
    assert_eq!(settings.broadcast.heartbeat_interval, Duration::from_secs(30));
}

#[test]
fn blank_database_url_selects_memory_store() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn redis_backend_requires_url() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("Redis".to_string());

    let err = Settings::from_raw(raw.clone()).expect_err("missing url");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.redis_url",
            ..
        }
    ));

    raw.cache.redis_url = Some("redis://127.0.0.1:6379".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.backend, BackendKind::Redis);
}

#[test]
fn unknown_cache_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("memcached".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.backend",
            ..
        })
    ));
}

#[test]
fn zero_durations_and_capacities_are_rejected() {
    let mut raw = RawSettings::default();
    raw.broadcast.backlog_capacity = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.cache.posts_ttl_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn heat_weights_must_be_non_negative() {
    let mut raw = RawSettings::default();
    raw.heat.decay_rate = Some(-0.5);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "heat.decay_rate",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.heat.like_weight = Some(3.0);
    raw.heat.boost_window_hours = Some(12);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.heat.like_weight, 3.0);
    assert_eq!(settings.heat.boost_window, time::Duration::hours(12));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["emberfeed"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "emberfeed",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--database-url",
        "postgres://override",
        "--cache-backend",
        "redis",
        "--cache-redis-url",
        "redis://cache:6379",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.database_url.as_deref(),
                Some("postgres://override")
            );

            let mut raw = RawSettings::default();
            raw.apply_serve_overrides(&serve.overrides);
            let settings = Settings::from_raw(raw).expect("valid settings");
            assert_eq!(settings.cache.backend, BackendKind::Redis);
            assert_eq!(
                settings.database.url.as_deref(),
                Some("postgres://override")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_migrate_arguments() {
    let args = CliArgs::parse_from([
        "emberfeed",
        "migrate",
        "--database-url",
        "postgres://example",
    ]);

    match args.command.expect("migrate command") {
        Command::Migrate(migrate) => {
            assert_eq!(
                migrate.database.database_url.as_deref(),
                Some("postgres://example")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}
