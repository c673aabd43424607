use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgMatches, Command, value_parser};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use volcast::config::{Config, app_name, version};
use volcast::utils::sos::SignalOfStop;
use volcast::{
    BufferPool, DiscardSink, MemoryHorizon, SeekController, Shape, SharedVolume, TimelineStore, Volume,
    VolumeClient, VolumeServer, VolumeSink,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_json_file(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &matches);
    config.validate().context("invalid configuration")?;

    // gracefully stop on SIGINT, SIGTERM, or SIGHUP
    let sos = SignalOfStop::new();
    {
        let sos = sos.clone();
        ctrlc::set_handler(move || sos.cancel()).context("Error setting Ctrl-C handler")?;
    }

    match matches.subcommand() {
        Some(("serve", sub)) => serve(&config, sub, &sos),
        Some(("receive", sub)) => receive(&config, sub, &sos),
        _ => Err(anyhow!("no command given")),
    }
}

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .global(true),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("IP")
                .help("Address to listen on or connect to")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(value_parser!(u16))
                .global(true),
        )
        .arg(
            Arg::new("soft")
                .long("soft")
                .value_name("TIME POINTS")
                .help("Soft horizon: newest time points always retained")
                .value_parser(value_parser!(i64))
                .global(true),
        )
        .arg(
            Arg::new("hard")
                .long("hard")
                .value_name("TIME POINTS")
                .help("Hard horizon: older time points are released")
                .value_parser(value_parser!(i64))
                .global(true),
        )
        .arg(
            Arg::new("capacity")
                .long("capacity")
                .help("Buffer pool capacity")
                .value_parser(value_parser!(usize))
                .global(true),
        )
        .subcommand(
            Command::new("serve")
                .about("Stream a synthetic volume sequence")
                .arg(
                    Arg::new("size")
                        .long("size")
                        .help("Edge length of the generated cube")
                        .value_parser(value_parser!(u32).range(1..))
                        .default_value("32"),
                )
                .arg(
                    Arg::new("channels")
                        .long("channels")
                        .value_parser(value_parser!(i32).range(1..))
                        .default_value("1"),
                )
                .arg(
                    Arg::new("count")
                        .long("count")
                        .help("Number of time points to send (0 = until interrupted)")
                        .value_parser(value_parser!(i64).range(0..))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("period")
                        .long("period-ms")
                        .help("Delay between time points")
                        .value_parser(value_parser!(u64))
                        .default_value("100"),
                ),
        )
        .subcommand(
            Command::new("receive")
                .about("Receive volumes into a time-shift store")
                .arg(
                    Arg::new("seek")
                        .long("seek")
                        .value_name("RATIO")
                        .help("Normalized time shift in [-1, 1] applied after --seek-delay-ms")
                        .value_parser(value_parser!(f64))
                        .allow_negative_numbers(true),
                )
                .arg(
                    Arg::new("seek-delay")
                        .long("seek-delay-ms")
                        .value_parser(value_parser!(u64))
                        .default_value("2000"),
                ),
        )
}

fn apply_overrides(config: &mut Config, matches: &ArgMatches) {
    if let Some(address) = matches.get_one::<String>("address") {
        config.network.address = address.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.network.port = *port;
    }
    if let Some(soft) = matches.get_one::<i64>("soft") {
        config.horizon.soft_horizon = *soft;
    }
    if let Some(hard) = matches.get_one::<i64>("hard") {
        config.horizon.hard_horizon = *hard;
    }
    if let Some(capacity) = matches.get_one::<usize>("capacity") {
        config.pool.capacity = *capacity;
    }
}

fn serve(config: &Config, matches: &ArgMatches, sos: &SignalOfStop) -> Result<()> {
    let size = *matches.get_one::<u32>("size").unwrap_or(&32);
    let channels = *matches.get_one::<i32>("channels").unwrap_or(&1);
    let count = *matches.get_one::<i64>("count").unwrap_or(&0);
    let period = Duration::from_millis(*matches.get_one::<u64>("period").unwrap_or(&100));

    let shape = Shape::new(
        config.network.element_type,
        config.network.components,
        size,
        size,
        size,
    );
    let server = VolumeServer::new(BufferPool::new(config.pool.capacity), config)?;
    server.open().context("opening server")?;
    server.start()?;
    if let Some(addr) = server.local_addr() {
        info!("Serving {} volumes on {}", shape, addr);
    }

    let started = Instant::now();
    let mut time_index = 0i64;
    while !sos.cancelled() && (count == 0 || time_index < count) {
        for channel in 0..channels {
            server.send_with(shape, |volume| {
                volume.stamp(channel, time_index, started.elapsed().as_secs_f64());
                xor_pattern(volume, time_index);
            })?;
        }
        time_index += 1;
        if sos.wait_timeout(period) {
            break;
        }
    }

    // let the client drain what is already queued
    while server.pending() > 0 && !sos.wait_timeout(period) {}

    info!("{}", server.health().summary());
    server.close()?;
    Ok(())
}

/// Fill every voxel with `x ^ y ^ z ^ t`
fn xor_pattern(volume: &mut Volume, time_index: i64) {
    let [width, height, _] = volume.dims();
    let voxel_bytes = volume.shape().voxel_bytes();
    let (width, height) = (width as usize, height as usize);

    for (index, voxel) in volume.data_mut().chunks_exact_mut(voxel_bytes).enumerate() {
        let x = index % width;
        let y = (index / width) % height;
        let z = index / (width * height);
        voxel.fill((x ^ y ^ z ^ time_index as usize) as u8);
    }
}

/// Terminal sink logging what playback shows
struct PlaybackLog {
    inner: DiscardSink,
}

impl VolumeSink for PlaybackLog {
    fn accept(&self, volume: SharedVolume) -> volcast::Result<()> {
        debug!(
            "Playback: channel {} time index {} at {:.3}s",
            volume.channel, volume.time_index, volume.timestamp
        );
        self.inner.accept(volume)
    }

    fn pool(&self) -> BufferPool {
        self.inner.pool()
    }
}

/// Buffers needed to hold one channel between two eviction passes.
///
/// Eviction trims a channel to `hard` entries once per cleanup period, so up
/// to `hard + cleanup_period` volumes are stored just before a pass.
fn receive_pool_capacity(headroom: usize, horizon: &MemoryHorizon) -> usize {
    let history = horizon.hard().saturating_add(horizon.cleanup_period());
    headroom
        .saturating_add(usize::try_from(history).unwrap_or(usize::MAX))
        .saturating_add(1)
}

fn receive(config: &Config, matches: &ArgMatches, sos: &SignalOfStop) -> Result<()> {
    let horizon = config.memory_horizon();
    let capacity = receive_pool_capacity(config.pool.capacity, &horizon);
    let pool = BufferPool::new(capacity);
    info!(
        "Receiving with horizons {}/{} and {} buffers",
        horizon.soft(),
        horizon.hard(),
        capacity
    );

    let store = Arc::new(TimelineStore::new(
        horizon,
        Arc::new(PlaybackLog {
            inner: DiscardSink::new(pool.clone()),
        }),
    ));
    let client = VolumeClient::new(store.clone(), config)?;
    client.open().context("connecting to server")?;
    client.start()?;

    let seek = matches.get_one::<f64>("seek").copied();
    let seek_delay = Duration::from_millis(*matches.get_one::<u64>("seek-delay").unwrap_or(&2000));
    let mut controller = match seek {
        Some(_) => Some(SeekController::new(Arc::clone(&store))?),
        None => None,
    };

    let started = Instant::now();
    let mut seek_pending = seek;
    while client.is_receiving() && !sos.wait_timeout(Duration::from_secs(1)) {
        if let (Some(ratio), Some(controller)) = (seek_pending, controller.as_ref()) {
            if started.elapsed() >= seek_delay {
                controller.set_time_shift_normalized(ratio)?;
                seek_pending = None;
            }
        }

        if pool.checked_out() >= pool.capacity() {
            let reclaimed = store.reclaim_oldest((capacity / 4).max(1));
            warn!("Buffer pool exhausted, reclaimed {} volumes", reclaimed);
        }

        info!(
            "{} | time point {} | shift {} | channels {:?}",
            client.health().summary(),
            store.highest_time_index_seen(),
            store.time_shift(),
            store.available_channels()
        );
    }

    client.close()?;
    if let Some(controller) = controller.as_mut() {
        controller.shutdown();
    }
    store.close();
    info!("{}", client.health().summary());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_pool_covers_history_between_evictions() {
        let horizon = MemoryHorizon::new(100, 400);
        assert_eq!(horizon.cleanup_period(), 25);
        assert_eq!(receive_pool_capacity(20, &horizon), 20 + 400 + 25 + 1);

        let tight = MemoryHorizon::new(1, 2);
        assert_eq!(receive_pool_capacity(0, &tight), 2 + 1 + 1);
    }
}
