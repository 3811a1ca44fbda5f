use std::fmt::Write as _;
use std::path::Path;

use reservoir_core::ReservoirConfig;
use reservoir_core::duration::format_duration;
use reservoir_pool::{PoolConfig, SourceConfig};

/// Settings after defaults have been filled in.
pub struct Resolved {
    pub source: SourceConfig,
    pub pool: PoolConfig,
}

pub fn resolve(path: &Path) -> anyhow::Result<Resolved> {
    let config = ReservoirConfig::from_file(path)?;
    let source = SourceConfig::from_settings(&config.source)?;
    let pool = match &config.pool {
        Some(settings) => PoolConfig::from_settings(settings)?,
        None => PoolConfig::default(),
    };
    Ok(Resolved { source, pool })
}

pub fn check(path: &str, format: &str) -> anyhow::Result<()> {
    let resolved = resolve(Path::new(path))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&to_json(&resolved))?);
        }
        _ => {
            print!("{}", format_text(&resolved));
            println!("✓ {path} is valid");
        }
    }

    Ok(())
}

fn masked(password: &Option<String>) -> Option<&'static str> {
    password.as_ref().map(|_| "********")
}

pub fn to_json(resolved: &Resolved) -> serde_json::Value {
    let Resolved { source, pool } = resolved;
    serde_json::json!({
        "source": {
            "driver": source.driver,
            "url": source.url,
            "username": source.username,
            "password": masked(&source.password),
            "auto_commit": source.auto_commit,
            "isolation": source.default_isolation.map(|l| l.label()),
            "network_timeout": source.default_network_timeout.map(format_duration),
            "properties": source.driver_properties,
        },
        "pool": {
            "max_active": pool.max_active,
            "max_idle": pool.max_idle,
            "max_checkout_time": format_duration(pool.max_checkout_time),
            "time_to_wait": format_duration(pool.time_to_wait),
            "local_bad_connection_tolerance": pool.local_bad_connection_tolerance,
            "ping_enabled": pool.ping_enabled,
            "ping_query": pool.ping_query,
            "ping_connections_not_used_for": format_duration(pool.ping_connections_not_used_for),
            "drain_timeout": format_duration(pool.drain_timeout),
        },
    })
}

pub fn format_text(resolved: &Resolved) -> String {
    let Resolved { source, pool } = resolved;
    let unset = || "-".to_string();
    let mut out = String::new();

    let _ = writeln!(out, "[source]");
    let _ = writeln!(out, "  driver           {}", source.driver);
    let _ = writeln!(out, "  url              {}", source.url);
    let _ = writeln!(out, "  username         {}", source.username.clone().unwrap_or_else(unset));
    let _ = writeln!(out, "  password         {}", masked(&source.password).unwrap_or("-"));
    let _ = writeln!(
        out,
        "  auto_commit      {}",
        source.auto_commit.map(|b| b.to_string()).unwrap_or_else(unset)
    );
    let _ = writeln!(
        out,
        "  isolation        {}",
        source.default_isolation.map(|l| l.to_string()).unwrap_or_else(unset)
    );
    let _ = writeln!(
        out,
        "  network_timeout  {}",
        source.default_network_timeout.map(format_duration).unwrap_or_else(unset)
    );
    for (key, value) in &source.driver_properties {
        let _ = writeln!(out, "  property         {key} = {value}");
    }

    let _ = writeln!(out, "[pool]");
    let _ = writeln!(out, "  max_active       {}", pool.max_active);
    let _ = writeln!(out, "  max_idle         {}", pool.max_idle);
    let _ = writeln!(out, "  max_checkout     {}", format_duration(pool.max_checkout_time));
    let _ = writeln!(out, "  time_to_wait     {}", format_duration(pool.time_to_wait));
    let _ = writeln!(out, "  bad_tolerance    {}", pool.local_bad_connection_tolerance);
    if pool.ping_enabled {
        let _ = writeln!(
            out,
            "  ping             {} (idle > {})",
            pool.ping_query,
            format_duration(pool.ping_connections_not_used_for)
        );
    } else {
        let _ = writeln!(out, "  ping             disabled");
    }
    let _ = writeln!(out, "  drain_timeout    {}", format_duration(pool.drain_timeout));
    out
}
