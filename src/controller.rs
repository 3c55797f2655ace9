//! Orchestrates startup, sensor subscription, debouncing, re-evaluation, the
//! cycling monitor, and manual override requests. See spec §4.4.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;

use crate::actuator::Actuator;
use crate::clock::Clock;
use crate::config::HagConfig;
use crate::cycling_monitor::{CyclingHealth, CyclingMonitor, StateChangeRecord};
use crate::error::HagError;
use crate::evaluation::cache::EvaluationCache;
use crate::evaluation::DecisionEngine;
use crate::gateway::{PlatformGateway, StateChangedEvent};
use crate::state_machine::{self, DefrostTimer, HvacEvent, HvacState, HvacStateMachine, ManualOverrideRequest};

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub running: bool,
    pub connected: bool,
    pub current_state: HvacState,
    pub last_error: Option<String>,
    pub cycling_health: CyclingHealth,
}

/// Owns the state-machine task, the evaluation cache, and the cycling
/// monitor (§3 ownership summary). Sensor events and manual overrides arrive
/// over the same FIFO channel so ordering is preserved end-to-end.
pub struct Controller {
    config: Arc<HagConfig>,
    gateway: Arc<dyn PlatformGateway>,
    actuator: Arc<Actuator>,
    events: mpsc::UnboundedSender<HvacEvent>,
    status_rx: watch::Receiver<StatusSnapshot>,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    event_loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Controller {
    pub async fn start(
        config: Arc<HagConfig>,
        gateway: Arc<dyn PlatformGateway>,
        decision_engine: Arc<dyn DecisionEngine>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HagError> {
        gateway.connect().await?;

        let hvac_options = Arc::new(config.hvac_options.clone());
        let actuator = Arc::new(Actuator::new(gateway.clone(), hvac_options.hvac_entities.clone()));

        let mut machine = HvacStateMachine::new(hvac_options.clone(), decision_engine, clock);
        machine.start()?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<HvacEvent>();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            running: true,
            connected: gateway.is_connected(),
            current_state: machine.state(),
            last_error: None,
            cycling_health: CyclingHealth::InsufficientData,
        });

        let cache_ttl = hvac_options.evaluation_cache_ms;
        let mut cache = EvaluationCache::new(cache_ttl);
        let mut cycling_monitor = CyclingMonitor::new();

        let event_tx_for_sensors = event_tx.clone();
        let temp_sensor = hvac_options.temp_sensor.clone();
        let outdoor_sensor = hvac_options.outdoor_sensor.clone();
        let gateway_for_subscribe = gateway.clone();
        let subscribe_tx = event_tx_for_sensors.clone();
        gateway_for_subscribe
            .subscribe_state_changed(Box::new(move |event: StateChangedEvent| {
                forward_sensor_event(&temp_sensor, &outdoor_sensor, event, &subscribe_tx);
            }))
            .await?;

        // Seed initial temperatures via one-shot reads before the machine starts evaluating.
        let indoor = read_temperature(gateway.as_ref(), &hvac_options.temp_sensor).await;
        let outdoor = read_temperature(gateway.as_ref(), &hvac_options.outdoor_sensor).await;
        let _ = event_tx.send(HvacEvent::UpdateTemperatures { indoor, outdoor });
        let _ = event_tx.send(HvacEvent::AutoEvaluate);

        let actuator_for_loop = actuator.clone();
        let hvac_options_for_loop = hvac_options.clone();
        let gateway_for_loop = gateway.clone();
        let status_tx_for_loop = status_tx.clone();

        let event_loop_handle = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let fingerprint_gate = matches!(event, HvacEvent::UpdateTemperatures { .. });

                let transition = match machine.handle_event(event) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping event: state machine rejected it");
                        continue;
                    }
                };

                if transition.from != transition.to {
                    let record = StateChangeRecord {
                        timestamp: Utc::now(),
                        from_state: transition.from,
                        to_state: transition.to,
                        temperature: machine.context().indoor_temp,
                    };
                    cycling_monitor.record(record);
                }

                if let state_machine::EntryAction::RecordDefrostStart(timer) = &transition.action {
                    spawn_defrost_completion(*timer, event_tx_for_sensors.clone());
                }

                actuator_for_loop
                    .apply(
                        &transition.action,
                        &hvac_options_for_loop.heating,
                        &hvac_options_for_loop.cooling,
                    )
                    .await;

                // While heating, a newly-cold outdoor reading can make
                // `needsDefrost` true outside of the `AUTO_EVALUATE` path;
                // check on every settle so the defrost cycle starts promptly
                // (spec §4.2 `canDefrost` guard, `heating -> defrosting`).
                if machine.state() == HvacState::Heating
                    && machine.current_evaluation().is_some_and(|r| r.needs_defrost)
                {
                    let _ = event_tx_for_sensors.send(HvacEvent::DefrostNeeded);
                }

                let snapshot = StatusSnapshot {
                    running: true,
                    connected: gateway_for_loop.is_connected(),
                    current_state: machine.state(),
                    last_error: actuator_for_loop.last_error(),
                    cycling_health: cycling_monitor.health(Utc::now()),
                };
                let _ = status_tx_for_loop.send(snapshot);

                if fingerprint_gate {
                    maybe_auto_evaluate(&machine, &mut cache, &event_tx_for_sensors);
                }
            }
        });

        let tick_handle = spawn_periodic_tick(
            Duration::from_millis(config.hass_options.state_check_interval),
            event_tx.clone(),
        );

        Ok(Self {
            config,
            gateway,
            actuator,
            events: event_tx,
            status_rx,
            tick_handle: Mutex::new(Some(tick_handle)),
            event_loop_handle: Mutex::new(Some(event_loop_handle)),
        })
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    /// Enqueues a `MANUAL_OVERRIDE` event. The override persists until the
    /// following `AUTO_EVALUATE` or its `expires_at` is reached.
    pub fn manual_override(&self, request: ManualOverrideRequest) -> Result<(), HagError> {
        self.events
            .send(HvacEvent::ManualOverride(request))
            .map_err(|_| HagError::Connection("controller event channel closed".into()))?;

        if let Some(expires_at) = request.expires_at {
            let tx = self.events.clone();
            let now = Utc::now();
            let delay = (expires_at - now).to_std().unwrap_or(Duration::from_secs(0));
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(HvacEvent::AutoEvaluate);
            });
        }
        Ok(())
    }

    /// Stop periodic tick, unsubscribe, stop the state machine, and
    /// disconnect the gateway. All releases run even if one fails;
    /// collected errors are returned to the caller.
    pub async fn shutdown(&self) -> Result<(), HagError> {
        let mut errors = Vec::new();

        if let Some(handle) = self.tick_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.gateway.disconnect().await {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HagError::Connection(errors.join("; ")))
        }
    }

    pub fn config(&self) -> &HagConfig {
        &self.config
    }

    pub fn actuator(&self) -> &Actuator {
        &self.actuator
    }
}

fn forward_sensor_event(
    temp_sensor: &str,
    outdoor_sensor: &str,
    event: StateChangedEvent,
    tx: &mpsc::UnboundedSender<HvacEvent>,
) {
    let Ok(value) = event.new_state.parse::<f64>() else {
        tracing::debug!(entity_id = %event.entity_id, state = %event.new_state, "non-numeric sensor state, ignoring");
        return;
    };

    let update = if event.entity_id == temp_sensor {
        HvacEvent::UpdateTemperatures { indoor: Some(value), outdoor: None }
    } else if event.entity_id == outdoor_sensor {
        HvacEvent::UpdateTemperatures { indoor: None, outdoor: Some(value) }
    } else {
        return;
    };

    let _ = tx.send(update);
}

async fn read_temperature(gateway: &dyn PlatformGateway, entity_id: &str) -> Option<f64> {
    match gateway.get_state(entity_id).await {
        Ok(state) => state.state.parse::<f64>().ok(),
        Err(e) => {
            tracing::warn!(entity_id, error = %e, "failed to seed initial temperature");
            None
        }
    }
}

fn maybe_auto_evaluate(
    machine: &HvacStateMachine,
    cache: &mut EvaluationCache,
    tx: &mpsc::UnboundedSender<HvacEvent>,
) {
    let context = machine.context();
    let (Some(indoor), Some(outdoor)) = (context.indoor_temp, context.outdoor_temp) else {
        let _ = tx.send(HvacEvent::AutoEvaluate);
        return;
    };

    let key = EvaluationCache::fingerprint(
        indoor,
        outdoor,
        context.current_hour,
        context.is_weekday,
        context.system_mode,
        machine.last_defrost(),
    );

    if cache.get(&key).is_some() {
        return;
    }
    // The cached result itself is never read back here: its presence alone
    // throttles re-dispatch for fingerprint-identical sensor noise. The
    // state machine still runs the real evaluation once AUTO_EVALUATE lands.
    cache.insert(
        key,
        crate::evaluation::EvaluationResult {
            should_heat: false,
            should_cool: false,
            needs_defrost: false,
            reason: crate::evaluation::EvaluationReason::Idle,
        },
    );
    let _ = tx.send(HvacEvent::AutoEvaluate);
}

/// Wakes up once after `timer.duration` and emits `DEFROST_COMPLETE`
/// (spec §4.2 transition table, "defrosting | after defrost.durationSeconds").
/// An explicit `DEFROST_COMPLETE` event arriving first is handled the same
/// way by the state machine; this timer firing late against an already-idle
/// machine is a no-op (`handle_defrost_complete` only acts from `Defrosting`).
fn spawn_defrost_completion(
    timer: DefrostTimer,
    tx: mpsc::UnboundedSender<HvacEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timer.duration).await;
        let _ = tx.send(HvacEvent::DefrostComplete);
    })
}

fn spawn_periodic_tick(
    interval_duration: Duration,
    tx: mpsc::UnboundedSender<HvacEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(interval_duration);
        loop {
            ticker.tick().await;
            if tx.send(HvacEvent::AutoEvaluate).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{
        ActiveHours, AppOptions, CoolingParams, DefrostParams, HagConfig, HassOptions,
        HeatingParams, HvacOptions, HvacUnitDescriptor, SystemMode, TemperatureThresholds,
    };
    use crate::evaluation::RuleBasedEngine;
    use crate::gateway::{DryRunGateway, EntityState};
    use crate::state_machine::OverrideMode;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn config(system_mode: SystemMode, state_check_interval: u64) -> Arc<HagConfig> {
        Arc::new(HagConfig {
            app_options: AppOptions {
                log_level: "info".into(),
                use_ai: false,
                ai_model: None,
                ai_temperature: None,
                openai_api_key: None,
            },
            hass_options: HassOptions {
                ws_url: "ws://localhost:8123/api/websocket".into(),
                rest_url: "http://localhost:8123".into(),
                token: "test-token".into(),
                max_retries: 3,
                retry_delay_ms: 10,
                state_check_interval,
                timeout_ms: None,
            },
            hvac_options: HvacOptions {
                temp_sensor: "sensor.indoor_temperature".into(),
                outdoor_sensor: "sensor.outdoor_temperature".into(),
                system_mode,
                hvac_entities: vec![HvacUnitDescriptor {
                    entity_id: "climate.living_room".into(),
                    enabled: true,
                    defrost: false,
                }],
                heating: HeatingParams {
                    temperature: 21.0,
                    preset_mode: "comfort".into(),
                    temperature_thresholds: TemperatureThresholds {
                        indoor_min: 19.0,
                        indoor_max: 22.0,
                        outdoor_min: -10.0,
                        outdoor_max: 15.0,
                    },
                    defrost: Some(DefrostParams {
                        temperature_threshold: 0.0,
                        period_seconds: 3600,
                        duration_seconds: 1,
                    }),
                },
                cooling: CoolingParams {
                    temperature: 24.0,
                    preset_mode: "comfort".into(),
                    temperature_thresholds: TemperatureThresholds {
                        indoor_min: 23.0,
                        indoor_max: 26.0,
                        outdoor_min: 10.0,
                        outdoor_max: 45.0,
                    },
                },
                active_hours: Some(ActiveHours { start: 0, start_weekday: 0, end: 23 }),
                evaluation_cache_ms: 0,
            },
        })
    }

    async fn seeded_gateway(indoor: &str, outdoor: &str) -> Arc<DryRunGateway> {
        let gateway = Arc::new(DryRunGateway::new());
        gateway
            .seed_state("sensor.indoor_temperature", EntityState { state: indoor.into(), attributes: HashMap::new() })
            .await;
        gateway
            .seed_state("sensor.outdoor_temperature", EntityState { state: outdoor.into(), attributes: HashMap::new() })
            .await;
        gateway
            .seed_state("sensor.living_room_temperature", EntityState { state: indoor.into(), attributes: HashMap::new() })
            .await;
        gateway
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 7, 20, 10, 0, 0).unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn startup_seeds_temperatures_and_settles_into_heating() {
        let cfg = config(SystemMode::Auto, 10);
        let gateway = seeded_gateway("18.0", "5.0").await;
        let controller = Controller::start(cfg, gateway, Arc::new(RuleBasedEngine), clock())
            .await
            .unwrap();

        // idle -> evaluating on the seeded AUTO_EVALUATE; evaluating -> heating
        // on the second AUTO_EVALUATE that UpdateTemperatures' cache-miss check
        // dispatches right behind it.
        tokio::time::advance(Duration::from_millis(30)).await;
        tokio::task::yield_now().await;

        assert_eq!(controller.status().current_state, HvacState::Heating);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_reported_in_status_until_expiry() {
        let cfg = config(SystemMode::Auto, 60_000);
        let gateway = seeded_gateway("18.0", "5.0").await;
        let controller = Controller::start(cfg, gateway, Arc::new(RuleBasedEngine), clock())
            .await
            .unwrap();
        tokio::task::yield_now().await;

        controller
            .manual_override(ManualOverrideRequest {
                mode: OverrideMode::Off,
                target_temp: None,
                expires_at: None,
            })
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(controller.status().current_state, HvacState::ManualOverride);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn defrost_cycle_runs_end_to_end_through_the_controller() {
        // Outdoor reading below the defrost threshold while heating: the
        // controller must auto-fire DEFROST_NEEDED, then DEFROST_COMPLETE
        // once the 1-second defrost duration elapses. A long tick interval
        // keeps the periodic AUTO_EVALUATE from interleaving with the
        // defrost transitions under test here.
        let cfg = config(SystemMode::Auto, 60_000);
        let gateway = seeded_gateway("18.0", "-5.0").await;
        let controller = Controller::start(cfg, gateway, Arc::new(RuleBasedEngine), clock())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.status().current_state, HvacState::Defrosting);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.status().current_state, HvacState::Heating);

        controller.shutdown().await.unwrap();
    }
}
