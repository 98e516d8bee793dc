mod broker;
mod command;
mod config;
mod device;
mod error;
mod hub;
mod mqtt;
mod rules;
mod web;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting farm broker (mqtt={}:{}, topic={}, offline after {}ms)",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.mqtt.sub_topic,
        config.liveness.offline_timeout.as_millis(),
    );

    // Channels
    let (inbound_tx, inbound_rx) = mpsc::channel::<mqtt::InboundMessage>(200);
    let (outbound_tx, outbound_rx) = mpsc::channel::<mqtt::OutboundPublish>(100);

    let command_timeout = config.liveness.command_timeout;
    let registry = Arc::new(device::registry::DeviceRegistry::new(
        config.liveness.history_limit,
    ));
    let router = Arc::new(command::router::CommandRouter::new(
        config.mqtt.topic_prefix.clone(),
        outbound_tx,
    ));
    let rules = Arc::new(rules::store::RulesStore::new(router.clone(), command_timeout));
    let hub = Arc::new(hub::FanoutHub::new(
        registry.clone(),
        rules.clone(),
        router.clone(),
        command_timeout,
    ));

    // MQTT event loop: telemetry in, commands out
    let mqtt_client = mqtt::client::MqttClient::new(&config);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(inbound_tx, outbound_rx).await;
    });

    let broker = broker::Broker::new(
        registry.clone(),
        rules.clone(),
        hub.clone(),
        config.liveness.offline_timeout,
    );
    let broker_handle = tokio::spawn(broker.run(inbound_rx));

    let state = web::AppState {
        registry,
        rules,
        router,
        hub,
        command_timeout,
    };
    let port = config.server.port;
    let mut server_handle = tokio::spawn(async move { web::serve(state, port).await });

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("HTTP server stopped"),
                Ok(Err(e)) => error!("HTTP server failed: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    // Cleanup
    server_handle.abort();
    mqtt_handle.abort();
    broker_handle.abort();
    info!("farm broker stopped");
}

#[cfg(unix)]
async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
