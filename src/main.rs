//! TWS handover simulator
//!
//! Runs two earbuds in one process, keeps simulated traffic flowing to the
//! primary and swaps roles periodically. Vetoed attempts are retried with
//! backoff.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::{
   select, signal,
   sync::Notify,
   time::{self, Instant, MissedTickBehavior},
};

use tws_handover::{
   config::{Config, PeerConfig},
   earbud::{Earbud, Role},
   error::{HandoverError, Result},
   event::{EventBus, EventSender, HandoverEvent},
   peer::{BdAddr, PeerIdentity, Transport},
   runtime::{Message, MessageKind, Packet, TaskId},
};

/// Longest wait between vetoed attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting TWS handover simulator...");

   // Load configuration
   let mut config = Config::load()?;
   if config.peers.is_empty() {
      config.peers.push(PeerConfig {
         address: BdAddr::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]),
         transport: Transport::BrEdr,
         name: "Phone".into(),
         streaming: true,
      });
   }
   info!(
      "Loaded configuration with {} peers, window {} bytes",
      config.peers.len(),
      config.window_size
   );

   // Create event channel
   let event_bus = EventProcessor::new();
   event_bus.clone().spawn_dispatcher();

   let mut simulator = Simulator::new(config, event_bus)?;
   simulator.run().await?;

   info!("Shutting down simulator...");
   Ok(())
}

struct Simulator {
   config: Config,
   earbuds: [Earbud; 2],
   retry_count: u32,
   retry_at: Option<Instant>,
}

impl Simulator {
   fn new(config: Config, events: EventSender) -> Result<Self> {
      let mut left = Earbud::new("left", Role::Primary, config.window_size, Some(events.clone()))?;
      let right = Earbud::new("right", Role::Secondary, config.window_size, Some(events))?;
      for peer in &config.peers {
         left.connect_phone(peer.identity(), peer.streaming)?;
      }
      Ok(Self {
         config,
         earbuds: [left, right],
         retry_count: 0,
         retry_at: None,
      })
   }

   async fn run(&mut self) -> Result<()> {
      let mut handover_interval =
         time::interval(Duration::from_secs(self.config.handover_interval_sec));
      handover_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      // the first tick fires immediately
      handover_interval.tick().await;

      let mut traffic_interval =
         time::interval(Duration::from_millis(self.config.traffic_interval_ms));
      traffic_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let shutdown = signal::ctrl_c();
      tokio::pin!(shutdown);

      loop {
         select! {
             _ = handover_interval.tick() => {
                 self.retry_count = 0;
                 self.attempt();
             }
             () = wait(self.retry_at) => {
                 self.retry_at = None;
                 self.attempt();
             }
             _ = traffic_interval.tick() => {
                 self.traffic();
             }
             res = &mut shutdown => {
                 res?;
                 return Ok(());
             }
         }
      }
   }

   fn attempt(&mut self) {
      let retry_limit = self.config.veto_retry_count;
      let (from, to) = pair(&mut self.earbuds);
      let peers = from.peers();
      if peers.is_empty() {
         debug!("No peers on {}, nothing to hand over", from.name());
         return;
      }

      match Earbud::handover(from, to, &peers) {
         Ok(()) => {
            info!("{} is now primary", to.name());
            debug!("{}", to.describe());
            self.retry_count = 0;
         },
         Err(HandoverError::Vetoed { peer, profile }) if self.retry_count < retry_limit => {
            self.retry_count += 1;
            let delay = calc_retry_delay(self.retry_count);
            info!("{profile} vetoed {peer}, retrying in {delay:?}");
            self.retry_at = Some(Instant::now() + delay);
         },
         Err(HandoverError::Vetoed { .. }) => {
            warn!("Giving up after {} vetoed attempts", self.retry_count);
            self.retry_count = 0;
         },
         Err(e) => error!("Handover failed: {e}"),
      }
   }

   /// Queues messages on the primary and lets its tasks catch up at random,
   /// so some attempts find work in flight.
   fn traffic(&mut self) {
      let (primary, _) = pair(&mut self.earbuds);
      let peers = primary.peers();
      let mut rng = rand::thread_rng();
      if let Some(peer) = peers.get(rng.gen_range(0..peers.len().max(1))) {
         let (task, kind) = traffic_for(peer, &mut rng);
         primary
            .scheduler()
            .post(task, Message::for_peer(*peer, kind));
      }
      if rng.gen_bool(0.6) {
         let handled = primary.pump();
         debug!("{} handled {handled} message(s)", primary.name());
      }
   }
}

/// Primary first.
fn pair(earbuds: &mut [Earbud; 2]) -> (&mut Earbud, &mut Earbud) {
   let [left, right] = earbuds;
   if left.is_primary() {
      (left, right)
   } else {
      (right, left)
   }
}

fn traffic_for(peer: &PeerIdentity, rng: &mut impl Rng) -> (TaskId, MessageKind) {
   if peer.transport == Transport::Le {
      return (TaskId::ScanServer, MessageKind::Timer);
   }
   match rng.gen_range(0..3) {
      0 => {
         let packet: Packet = (0..8).map(|_| rng.r#gen()).collect();
         (TaskId::StreamControl, MessageKind::Data(packet))
      },
      1 => (TaskId::RemoteControl, MessageKind::Timer),
      _ => (TaskId::ConnectionManager, MessageKind::ModeChange),
   }
}

async fn wait(deadline: Option<Instant>) {
   match deadline {
      Some(deadline) => time::sleep_until(deadline).await,
      None => std::future::pending().await,
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_millis(500);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

struct EventProcessor {
   queue: SegQueue<(Option<PeerIdentity>, HandoverEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Option<PeerIdentity>, HandoverEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn dispatch(&self, (peer, event): (Option<PeerIdentity>, HandoverEvent)) {
      let peer = peer.map_or_else(|| "-".to_string(), |p| p.to_string());
      match event {
         HandoverEvent::Vetoed(profile) => {
            info!("[{peer}] vetoed by {profile}");
         },
         HandoverEvent::Marshalled { bytes } => {
            debug!("[{peer}] marshalled {bytes} bytes");
         },
         HandoverEvent::Unmarshalled { bytes } => {
            debug!("[{peer}] unmarshalled {bytes} bytes");
         },
         HandoverEvent::Committed { primary } => {
            debug!("[{peer}] committed, primary: {primary}");
         },
         HandoverEvent::Completed { primary } => {
            debug!("handover completed, primary: {primary}");
         },
         HandoverEvent::Aborted => {
            warn!("handover aborted");
         },
      }
   }

   fn spawn_dispatcher(self: Arc<Self>) {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            self.dispatch(event);
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, peer: Option<&PeerIdentity>, event: HandoverEvent) {
      self.queue.push((peer.copied(), event));
      self.notifier.notify_waiters();
   }
}
