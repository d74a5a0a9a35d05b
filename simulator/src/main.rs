mod telemetry;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::{Data, Device, SensorEvent};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const BURST_SIZE: usize = 200;

/// Publishes synthetic sensor readings to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Readings go to `<topic-prefix>/<device-id>`
    #[arg(long, env = "TOPIC_PREFIX", default_value = "sensors")]
    topic_prefix: String,

    /// Messages per second
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    #[arg(long, env = "MQTT_QOS", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: u8,

    /// Fraction of messages sent without a timestamp
    #[arg(long, env = "NO_TIMESTAMP_RATIO", default_value_t = 0.0, value_parser = parse_ratio)]
    no_timestamp_ratio: f64,
}

fn parse_ratio(raw: &str) -> Result<f64, String> {
    let ratio: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{}` is not a number", raw))?;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(format!("{} is not between 0 and 1", ratio));
    }
    Ok(ratio)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let qos = match args.qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    };
    let rate = args.rate.max(1);
    let devices = args.devices.max(1);

    info!("Starting sensor simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, rate, devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish readings");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / rate);

    info!(
        "Publishing in bursts of {} messages every {:?}",
        BURST_SIZE, burst_interval
    );

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device_id = format!("sensor-{}", counter % devices as u64);
            let with_timestamp = !rng.gen_bool(args.no_timestamp_ratio);
            let event = generate_event(&mut rng, device_id, with_timestamp);

            let topic = format!("{}/{}", args.topic_prefix, event.device.id);
            let payload = match serde_json::to_string(&event) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize reading: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, qos, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter % 10000 == 0 {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

fn generate_event(rng: &mut impl Rng, device_id: String, with_timestamp: bool) -> SensorEvent {
    let value = if rng.gen_bool(0.05) {
        rng.gen_range(-50.0..100.0) // 5% outliers
    } else {
        rng.gen_range(15.0..35.0)
    };

    SensorEvent {
        device: Device { id: device_id },
        data: Data {
            value,
            timestamp: with_timestamp
                .then(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        },
    }
}
