//! Scripted walk through the overlay lifecycle on a console surface

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, ValueEnum};
use overlay_kit::{
    Config, ExitTransition, OverlayContext, OverlayHost, OverlayRegistry, SlotId, Surface,
    TransitionState,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Run the scripted overlay demo
#[derive(Debug, Default, Args)]
pub struct DemoCommand {
    /// Run only one scenario
    #[arg(long, value_enum)]
    pub only: Option<Scenario>,

    /// Print registry events as JSON lines
    #[arg(long)]
    pub events: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// A modal that saves and closes itself
    Modal,
    /// A drawer closed from outside while it animates away
    Drawer,
    /// A popover replaced by a newer one in the same slot
    Popover,
}

#[derive(Debug, Clone, Copy)]
enum PanelKind {
    Modal,
    Drawer,
    Popover,
}

/// Payload shown by the console surface
#[derive(Debug, Clone)]
struct Panel {
    kind: PanelKind,
    title: String,
}

impl Panel {
    fn new(kind: PanelKind, title: &str) -> Self {
        Self {
            kind,
            title: title.to_string(),
        }
    }
}

impl fmt::Display for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PanelKind::Modal => "modal",
            PanelKind::Drawer => "drawer",
            PanelKind::Popover => "popover",
        };
        write!(f, "{} \"{}\"", kind, self.title)
    }
}

/// Prints mounts and plays a timed exit animation for every panel
struct ConsoleSurface {
    exit_transition: Duration,
    mounts: mpsc::UnboundedSender<SlotId>,
}

#[async_trait]
impl Surface<Panel> for ConsoleSurface {
    async fn mount(&mut self, slot: SlotId, payload: Arc<Panel>, context: OverlayContext) -> Result<()> {
        println!("  [mount]   #{} {}", slot, payload);

        if let Some(transition) = ExitTransition::from_context::<String>(&context, true)? {
            let overlay = context.overlay_ref::<String>()?;
            let mut states = transition.watch();
            let duration = self.exit_transition;

            tokio::spawn(async move {
                let exiting = async {
                    states
                        .wait_for(|state| *state == TransitionState::Exiting)
                        .await
                        .is_ok()
                };
                tokio::select! {
                    exiting = exiting => {
                        if exiting {
                            println!("  [animate] #{} exiting for {:?}", slot, duration);
                            sleep(duration).await;
                            transition.finish();
                        }
                    }
                    _ = overlay.after_closed() => {}
                }
            });
        }

        let _ = self.mounts.send(slot);
        Ok(())
    }

    async fn unmount(&mut self, slot: SlotId) -> Result<()> {
        println!("  [unmount] #{}", slot);
        Ok(())
    }
}

impl DemoCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let registry = OverlayRegistry::<Panel>::new();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        registry.set_event_sender(events_tx);
        let print_events = self.events;
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                debug!(?event, "Overlay event");
                if print_events {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("  [event]   {}", line),
                        Err(e) => debug!("Failed to serialize event: {}", e),
                    }
                }
            }
        });

        let (mounts_tx, mut mounts) = mpsc::unbounded_channel();
        let surface = ConsoleSurface {
            exit_transition: config.exit_transition(),
            mounts: mounts_tx,
        };
        let mut host = OverlayHost::new(registry.clone(), surface);
        host.set_prune_closed(config.prune_closed);

        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(host.run(async {
            let _ = stopped.await;
        }));

        let scenarios = match self.only {
            Some(scenario) => vec![scenario],
            None => vec![Scenario::Modal, Scenario::Drawer, Scenario::Popover],
        };

        for scenario in scenarios {
            info!("Running scenario: {:?}", scenario);
            match scenario {
                Scenario::Modal => run_modal(&registry, &mut mounts, config).await?,
                Scenario::Drawer => run_drawer(&registry, &mut mounts).await?,
                Scenario::Popover => run_popover(&registry, &mut mounts).await?,
            }
        }

        registry.settle_pending().await?;
        let _ = stop.send(());
        running.await.context("Overlay host task failed")??;

        let snapshot = registry.snapshot();
        info!(
            records = snapshot.len(),
            any_open = snapshot.is_any_open(),
            "Demo finished"
        );
        Ok(())
    }
}

/// Wait until the host has mounted `slot`
async fn wait_mounted(mounts: &mut mpsc::UnboundedReceiver<SlotId>, slot: SlotId) -> Result<()> {
    while let Some(mounted) = mounts.recv().await {
        if mounted == slot {
            return Ok(());
        }
    }
    Err(anyhow::anyhow!("Surface stopped before slot {} was mounted", slot))
}

async fn run_modal(
    registry: &OverlayRegistry<Panel>,
    mounts: &mut mpsc::UnboundedReceiver<SlotId>,
    config: &Config,
) -> Result<()> {
    println!("Modal closed from inside:");
    let editor = registry.controller::<String>();
    let overlay = editor.open(Panel::new(PanelKind::Modal, "Edit profile"));
    wait_mounted(mounts, editor.slot()).await?;

    let delay = config.hook_delay();
    let _save = overlay.on_before_close(move |result: Option<String>| async move {
        info!("Saving before close: {:?}", result);
        sleep(delay).await;
        Ok(())
    });

    let started = Instant::now();
    OverlayContext::for_overlay(overlay.clone())
        .scope(async {
            let inside = OverlayContext::current().overlay_ref::<String>()?;
            inside.close(Some("profile saved".to_string())).await
        })
        .await?;

    println!(
        "  result: {:?} after {:?}",
        overlay.after_closed().await,
        started.elapsed()
    );
    Ok(())
}

async fn run_drawer(
    registry: &OverlayRegistry<Panel>,
    mounts: &mut mpsc::UnboundedReceiver<SlotId>,
) -> Result<()> {
    println!("Drawer closed from outside:");
    let drawer = registry.controller::<String>();
    let overlay = drawer.open(Panel::new(PanelKind::Drawer, "Notifications"));
    wait_mounted(mounts, drawer.slot()).await?;

    let started = Instant::now();
    drawer.close();
    let result = overlay.after_closed().await;

    println!("  result: {:?} after {:?}", result, started.elapsed());
    Ok(())
}

async fn run_popover(
    registry: &OverlayRegistry<Panel>,
    mounts: &mut mpsc::UnboundedReceiver<SlotId>,
) -> Result<()> {
    println!("Popover replaced in its slot:");
    let popover = registry.controller::<String>();
    let first = popover.open(Panel::new(PanelKind::Popover, "Search hints"));
    wait_mounted(mounts, popover.slot()).await?;

    let second = popover.open(Panel::new(PanelKind::Popover, "Recent searches"));
    wait_mounted(mounts, popover.slot()).await?;
    println!("  first result: {:?}", first.after_closed().await);

    second.close(Some("picked overlay-kit".to_string())).await?;
    println!("  second result: {:?}", second.after_closed().await);
    Ok(())
}
