use smgw2mqtt::{Config, GatewayManager, GatewayRegistry, MqttManager};
use tokio::task::JoinHandle;
use std::time::Duration;
use log::{error, info};


#[cfg_attr(feature = "api", actix_web::main)]
#[cfg_attr(not(feature = "api"), tokio::main)]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("SMGW2MQTT_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
        }
    };

    if config.gateways.is_empty() {
        error!("No gateways configured, nothing to do");
    }

    // we need a channel for the gateways to send metering data to MQTT
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);
    let registry = GatewayRegistry::new();

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    /* One manager per gateway, a broken gateway must not stop the others */
    for gw_config in config.gateways.iter() {
        let mut manager = match GatewayManager::new(gw_config, config.mqtt.ha_enabled, tx.clone(), registry.clone()).await {
            Ok(m) => m,
            Err(e) => {
                error!("[{}] Unable to set up gateway: {e}", gw_config.name);
                continue;
            }
        };

        threads.push(tokio::spawn(async move {
            manager.start_thread().await;
        }));
    }

    /* Run our api gateway now */
    #[cfg(feature = "api")]
    {
        if config.httpd.enabled {
            let api = smgw2mqtt::ApiManager::new(&config, registry.clone());
            threads.push(tokio::spawn(async move {
                api.start_thread().await;
            }));
        }
    }

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kill_all_tasks = false;
        for task in threads.iter() {
            if task.is_finished() {
                kill_all_tasks = true;
            }
        }

        if kill_all_tasks == true {
            error!("A module stopped, shutting down");
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
    Ok(())
}
