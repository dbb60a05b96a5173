use std::time::Duration;

use clap::Parser;
use shared::{BookingId, Encoding, Location};
use tracker::{Phase, SessionConfig, SimulatedRoute};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Stream a simulated ambulance route into a booking room.
#[derive(Parser, Debug)]
#[command(name = "driver-sim", version)]
struct Args {
    /// Relay websocket endpoint.
    #[arg(long, env = "RELAY_URL", default_value = "ws://127.0.0.1:3000/ws")]
    relay_url: String,

    /// Booking whose room receives the positions.
    #[arg(long)]
    booking: BookingId,

    /// Explicit route as `lat,lng;lat,lng;...`.
    #[arg(long, value_delimiter = ';', value_parser = parse_point)]
    waypoints: Vec<Location>,

    /// Start of a straight-line route, used when no waypoints are given.
    #[arg(long, value_parser = parse_point, default_value = "12.9716,77.5946")]
    from: Location,

    /// End of a straight-line route.
    #[arg(long, value_parser = parse_point, default_value = "12.9352,77.6245")]
    to: Location,

    /// Points on the straight-line route, both ends included.
    #[arg(
        long,
        default_value_t = 6,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(2..)
    )]
    points: usize,

    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,

    #[arg(long, default_value = "json")]
    encoding: Encoding,

    /// Also act as dispatcher and acknowledge the booking before driving.
    #[arg(long)]
    acknowledge: bool,

    #[arg(long, requires = "acknowledge")]
    ack_message: Option<String>,

    /// Stay in the room this long after the route ends.
    #[arg(long, default_value_t = 0)]
    linger_secs: u64,
}

fn parse_point(raw: &str) -> Result<Location, String> {
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected lat,lng but got {raw:?}"))?;
    let lat = lat.trim().parse::<f64>().map_err(|e| format!("bad latitude: {e}"))?;
    let lng = lng.trim().parse::<f64>().map_err(|e| format!("bad longitude: {e}"))?;
    Location::new(lat, lng).map_err(|e| e.to_string())
}

async fn drive(args: Args) -> anyhow::Result<()> {
    let period = Duration::from_millis(args.interval_ms);
    let route = if args.waypoints.is_empty() {
        SimulatedRoute::straight_line(args.from, args.to, args.points, period)
    } else {
        SimulatedRoute::new(args.waypoints, period)
    };
    tracing::info!(
        booking_id = %args.booking,
        waypoints = route.remaining(),
        interval_ms = args.interval_ms,
        "starting simulated route"
    );

    let mut config = SessionConfig::new(args.relay_url, args.booking);
    config.encoding = args.encoding;
    let session = tracker::spawn(config, Some(Box::new(route)));

    if args.acknowledge {
        session.wait_for(|s| s.phase.is_connected()).await?;
        session.acknowledge(args.ack_message).await?;
    }

    let mut updates = session.subscribe();
    let finished = async {
        loop {
            let snapshot = updates.borrow_and_update().clone();
            tracing::debug!(phase = ?snapshot.phase, sent = snapshot.sent, "session update");
            if let Some(remote) = snapshot.remote_location {
                tracing::info!(lat = remote.lat, lng = remote.lng, "counterparty position");
            }
            if snapshot.phase == Phase::Idle || snapshot.phase == Phase::Disconnected {
                return snapshot;
            }
            if updates.changed().await.is_err() {
                return snapshot;
            }
        }
    };

    tokio::select! {
        snapshot = finished => {
            tracing::info!(sent = snapshot.sent, dispatch = snapshot.dispatch.label(), "route complete");
            if args.linger_secs > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(args.linger_secs)) => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
        }
    }

    session.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = drive(Args::parse()).await {
        tracing::error!(?err, "driver simulator exited with error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        let base = ["driver-sim", "--booking", "B1"];
        Args::try_parse_from(base.iter().chain(extra))
    }

    #[test]
    fn route_needs_at_least_two_points() {
        assert!(parse(&["--points", "0"]).is_err());
        assert!(parse(&["--points", "1"]).is_err());
        assert_eq!(parse(&["--points", "2"]).unwrap().points, 2);
        assert_eq!(parse(&[]).unwrap().points, 6);
    }

    #[test]
    fn waypoints_parse_as_lat_lng_pairs() {
        let args = parse(&["--waypoints", "12.97,77.59;12.98,77.60"]).unwrap();
        assert_eq!(
            args.waypoints,
            vec![
                Location::new(12.97, 77.59).unwrap(),
                Location::new(12.98, 77.60).unwrap(),
            ]
        );
        assert!(parse_point("12.97").is_err());
        assert!(parse_point("north,77.59").is_err());
    }
}
