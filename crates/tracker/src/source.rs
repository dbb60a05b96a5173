use std::time::Duration;

use async_trait::async_trait;
use geo::{Distance, Haversine, Point};
use shared::Location;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

pub const DEFAULT_ROUTE_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MIN_DISTANCE_M: f64 = 10.0;

/// Where a streaming session gets its own position from.
///
/// Implementations must be cancel safe: the driver races `next_fix` against
/// inbound frames and drops it whenever something else arrives first.
#[async_trait]
pub trait LocationSource: Send {
    /// Next position to publish, or `None` once nothing more will come.
    async fn next_fix(&mut self) -> Option<Location>;
}

/// Scripted route: one waypoint per tick, then done.
pub struct SimulatedRoute {
    waypoints: Vec<Location>,
    next: usize,
    period: Duration,
    ticker: Option<Interval>,
}

impl SimulatedRoute {
    pub fn new(waypoints: Vec<Location>, period: Duration) -> Self {
        Self {
            waypoints,
            next: 0,
            period: period.max(Duration::from_millis(1)),
            ticker: None,
        }
    }

    /// `points` evenly spaced positions from `from` to `to`, both included.
    pub fn straight_line(from: Location, to: Location, points: usize, period: Duration) -> Self {
        let points = points.max(2);
        let last = (points - 1) as f64;
        let waypoints = (0..points)
            .map(|i| {
                let t = i as f64 / last;
                Location {
                    lat: from.lat + (to.lat - from.lat) * t,
                    lng: from.lng + (to.lng - from.lng) * t,
                }
            })
            .collect();
        Self::new(waypoints, period)
    }

    pub fn remaining(&self) -> usize {
        self.waypoints.len() - self.next
    }
}

#[async_trait]
impl LocationSource for SimulatedRoute {
    async fn next_fix(&mut self) -> Option<Location> {
        let waypoint = *self.waypoints.get(self.next)?;
        let period = self.period;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
        self.next += 1;
        Some(waypoint)
    }
}

/// Fixes pushed by a device positioning sensor. A fix is only published
/// once the device has moved `min_distance_m` from the last published one.
/// When several fixes are waiting, only the newest is considered.
pub struct SensorFeed {
    fixes: mpsc::Receiver<Location>,
    min_distance_m: f64,
    last_sent: Option<Location>,
}

impl SensorFeed {
    pub fn new(fixes: mpsc::Receiver<Location>, min_distance_m: f64) -> Self {
        Self {
            fixes,
            min_distance_m,
            last_sent: None,
        }
    }

    /// Feed plus the sender the platform sensor callback writes into.
    pub fn channel(buffer: usize, min_distance_m: f64) -> (mpsc::Sender<Location>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx, min_distance_m))
    }
}

#[async_trait]
impl LocationSource for SensorFeed {
    async fn next_fix(&mut self) -> Option<Location> {
        loop {
            let mut fix = self.fixes.recv().await?;
            // fixes that queued up while nobody was publishing are already stale
            while let Ok(newer) = self.fixes.try_recv() {
                if newer.is_finite() {
                    fix = newer;
                }
            }
            if !fix.is_finite() {
                continue;
            }
            if let Some(last) = self.last_sent {
                if distance_m(last, fix) < self.min_distance_m {
                    continue;
                }
            }
            self.last_sent = Some(fix);
            return Some(fix);
        }
    }
}

/// Great-circle distance in meters.
pub fn distance_m(a: Location, b: Location) -> f64 {
    Haversine::distance(Point::new(a.lng, a.lat), Point::new(b.lng, b.lat))
}
