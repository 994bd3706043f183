//! Deterministic simulated sensor.
//!
//! Each device gets a physical profile derived from `SHA-256(seed || device_id)`:
//! per-channel base level, a manufacturing-variation oscillation and a noise
//! level. Two devices therefore look different, and one device looks the same
//! across runs with the same seed. Attack scenarios are injected through the
//! control methods (`inject_power_offset`, `set_synchronized_capture`,
//! `inject_cooling`, `set_offline`).

use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::{Channel, Reading, SensorError, SensorSource};

/// Standard normal sample (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

#[derive(Debug, Clone, Copy)]
struct Oscillator {
    base: f64,
    amplitude: f64,
    period: f64,
    noise: f64,
}

impl Oscillator {
    fn wave(&self, tick: u64, phase: f64) -> f64 {
        self.amplitude * (TAU * tick as f64 / self.period + phase).sin()
    }
}

#[derive(Debug, Clone)]
struct DeviceProfile {
    power: Oscillator,
    thermal: Oscillator,
    em: Oscillator,
    acoustic: Oscillator,
    noise: Oscillator,
    /// AR(1) coefficient of the noise channel.
    noise_ar: f64,
    /// Duration of one operation (µs) and its jitter.
    op_micros: f64,
    op_jitter: f64,
}

impl DeviceProfile {
    fn derive(seed: u64, device: &str) -> Self {
        let digest: [u8; 32] = Sha256::new()
            .chain_update(seed.to_le_bytes())
            .chain_update(device.as_bytes())
            .finalize()
            .into();
        let mut rng = StdRng::from_seed(digest);

        let power_base = rng.random_range(85.0..115.0);
        let power = Oscillator {
            base: power_base,
            amplitude: power_base * rng.random_range(0.04..0.08),
            period: rng.random_range(6.0..48.0),
            noise: power_base * rng.random_range(0.02..0.04),
        };
        let thermal = Oscillator {
            base: rng.random_range(38.0..48.0),
            amplitude: rng.random_range(0.05..0.2),
            period: rng.random_range(20.0..60.0),
            noise: rng.random_range(0.02..0.06),
        };
        let em_base = rng.random_range(5.0..15.0);
        let em = Oscillator {
            base: em_base,
            amplitude: em_base * rng.random_range(0.05..0.15),
            period: rng.random_range(6.0..32.0),
            noise: em_base * rng.random_range(0.02..0.05),
        };
        let acoustic = Oscillator {
            base: rng.random_range(30.0..40.0),
            amplitude: rng.random_range(0.5..2.0),
            period: rng.random_range(8.0..64.0),
            noise: rng.random_range(0.2..0.5),
        };
        let noise_sigma = rng.random_range(0.3..0.6);
        let noise = Oscillator {
            base: rng.random_range(8.0..12.0),
            amplitude: noise_sigma * rng.random_range(1.0..1.5),
            period: rng.random_range(8.0..40.0),
            noise: noise_sigma,
        };
        let noise_ar = rng.random_range(0.1..0.5);
        let op_micros = rng.random_range(20.0..80.0);
        let op_jitter = op_micros * rng.random_range(0.01..0.03);

        Self {
            power,
            thermal,
            em,
            acoustic,
            noise,
            noise_ar,
            op_micros,
            op_jitter,
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    profile: DeviceProfile,
    /// Per-channel sample counters, indexed by [`tick_index`].
    ticks: [u64; 5],
    /// Phase of the current power trace, re-drawn on every trigger.
    phase: f64,
    /// Energy jitter of the current power trace (mW).
    trace_offset: f64,
    noise_state: f64,
    power_offset_mw: f64,
    synchronized: bool,
    cooling: Option<(Instant, f64)>,
    offline: HashSet<Channel>,
}

impl DeviceState {
    fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            ticks: [0; 5],
            phase: 0.0,
            trace_offset: 0.0,
            noise_state: 0.0,
            power_offset_mw: 0.0,
            synchronized: false,
            cooling: None,
            offline: HashSet::new(),
        }
    }

    fn next_tick(&mut self, channel: Channel) -> u64 {
        let i = tick_index(channel);
        let t = self.ticks[i];
        self.ticks[i] += 1;
        t
    }
}

fn tick_index(channel: Channel) -> usize {
    match channel {
        Channel::Power => 0,
        Channel::Thermal => 1,
        Channel::Electromagnetic => 2,
        Channel::Acoustic => 3,
        Channel::Noise | Channel::Timing => 4,
    }
}

/// Fixed leakage pattern emitted by a device whose traces are being captured
/// in lock-step with its operations.
fn synchronized_pattern(tick: u64) -> f64 {
    let t = tick as f64;
    (TAU * t / 16.0).sin() + 0.5 * (TAU * t / 5.0 + 1.0).sin()
}

struct Inner {
    rng: StdRng,
    devices: HashMap<String, DeviceState>,
    /// Devices whose physical profile is copied from another device.
    aliases: HashMap<String, String>,
}

/// In-process sensor backend producing realistic, reproducible signals.
pub struct SimulatedSensor {
    seed: u64,
    noise_scale: f64,
    inner: Mutex<Inner>,
}

impl SimulatedSensor {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            noise_scale: 1.0,
            inner: Mutex::new(Inner {
                rng: StdRng::seed_from_u64(seed),
                devices: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    /// Multiply every channel's noise level by `scale`.
    pub fn with_noise_scale(mut self, scale: f64) -> Self {
        self.noise_scale = scale.max(0.0);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn noise_scale(&self) -> f64 {
        self.noise_scale
    }

    /// Make `clone` physically indistinguishable from `original`.
    pub fn clone_device(&self, clone: &str, original: &str) {
        let mut inner = self.lock();
        inner.aliases.insert(clone.to_string(), original.to_string());
        inner.devices.remove(clone);
    }

    /// Add `mw` to every subsequent power sample of `device`.
    pub fn inject_power_offset(&self, device: &str, mw: f64) {
        self.with_device(device, |d| d.power_offset_mw = mw);
    }

    /// Capture traces in lock-step with the device's operations, as a
    /// differential power analysis rig would.
    pub fn set_synchronized_capture(&self, device: &str, enabled: bool) {
        self.with_device(device, |d| d.synchronized = enabled);
    }

    /// Start cooling `device` at `c_per_min` °C per minute from now.
    pub fn inject_cooling(&self, device: &str, c_per_min: f64) {
        self.with_device(device, |d| d.cooling = Some((Instant::now(), c_per_min.abs())));
    }

    pub fn clear_cooling(&self, device: &str) {
        self.with_device(device, |d| d.cooling = None);
    }

    /// Take one channel of `device` offline or bring it back.
    pub fn set_offline(&self, device: &str, channel: Channel, offline: bool) {
        self.with_device(device, |d| {
            if offline {
                d.offline.insert(channel);
            } else {
                d.offline.remove(&channel);
            }
        });
    }

    /// Clear every injected scenario for `device`.
    pub fn reset(&self, device: &str) {
        self.with_device(device, |d| {
            d.power_offset_mw = 0.0;
            d.synchronized = false;
            d.cooling = None;
            d.offline.clear();
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<R>(&self, device: &str, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut inner = self.lock();
        let seed = self.seed;
        let profile_id = inner.aliases.get(device).cloned().unwrap_or_else(|| device.to_string());
        let state = inner
            .devices
            .entry(device.to_string())
            .or_insert_with(|| DeviceState::new(DeviceProfile::derive(seed, &profile_id)));
        f(state)
    }

    fn sample(&self, device: &str, channel: Channel) -> Result<Reading, SensorError> {
        if device.is_empty() {
            return Err(SensorError::UnknownDevice(device.to_string()));
        }
        let noise_scale = self.noise_scale;
        let mut inner = self.lock();
        let seed = self.seed;
        let profile_id = inner.aliases.get(device).cloned().unwrap_or_else(|| device.to_string());
        let Inner { rng, devices, .. } = &mut *inner;
        let state = devices
            .entry(device.to_string())
            .or_insert_with(|| DeviceState::new(DeviceProfile::derive(seed, &profile_id)));

        if state.offline.contains(&channel) {
            return Err(SensorError::Offline {
                device: device.to_string(),
                channel,
            });
        }

        let tick = state.next_tick(channel);
        let value = match channel {
            Channel::Power => {
                let p = state.profile.power;
                let signal = if state.synchronized {
                    p.base * 0.25 * synchronized_pattern(tick) + p.base * 0.01 * noise_scale * gaussian(rng)
                } else {
                    p.wave(tick, state.phase) + p.noise * noise_scale * gaussian(rng)
                };
                p.base + state.trace_offset + state.power_offset_mw + signal
            }
            Channel::Thermal => {
                let p = state.profile.thermal;
                let cooled = state
                    .cooling
                    .map(|(since, rate)| rate * since.elapsed().as_secs_f64() / 60.0)
                    .unwrap_or(0.0);
                p.base + p.wave(tick, 0.0) + p.noise * noise_scale * gaussian(rng) - cooled
            }
            Channel::Electromagnetic => {
                let p = state.profile.em;
                p.base + p.wave(tick, 0.0) + p.noise * noise_scale * gaussian(rng)
            }
            Channel::Acoustic => {
                let p = state.profile.acoustic;
                p.base + p.wave(tick, 0.0) + p.noise * noise_scale * gaussian(rng)
            }
            Channel::Noise => {
                let p = state.profile.noise;
                state.noise_state =
                    state.profile.noise_ar * state.noise_state + p.noise * noise_scale * gaussian(rng);
                p.base + p.wave(tick, 0.0) + state.noise_state
            }
            Channel::Timing => return Err(SensorError::Unsupported(Channel::Timing)),
        };
        Ok(Reading::now(value))
    }
}

impl SensorSource for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn read_power(&self, device: &str) -> Result<Reading, SensorError> {
        self.sample(device, Channel::Power)
    }

    fn read_thermal(&self, device: &str) -> Result<Reading, SensorError> {
        self.sample(device, Channel::Thermal)
    }

    fn read_em(&self, device: &str) -> Result<Reading, SensorError> {
        self.sample(device, Channel::Electromagnetic)
    }

    fn read_acoustic(&self, device: &str) -> Result<Reading, SensorError> {
        self.sample(device, Channel::Acoustic)
    }

    fn read_noise(&self, device: &str) -> Result<Reading, SensorError> {
        self.sample(device, Channel::Noise)
    }

    /// Start a new operation: the power trace restarts with a fresh phase and
    /// energy jitter, or with a fixed phase under synchronized capture.
    fn trigger_operation(&self, device: &str, _operation: &str) -> Result<(), SensorError> {
        if device.is_empty() {
            return Err(SensorError::UnknownDevice(device.to_string()));
        }
        let noise_scale = self.noise_scale;
        let mut inner = self.lock();
        let seed = self.seed;
        let profile_id = inner.aliases.get(device).cloned().unwrap_or_else(|| device.to_string());
        let Inner { rng, devices, .. } = &mut *inner;
        let state = devices
            .entry(device.to_string())
            .or_insert_with(|| DeviceState::new(DeviceProfile::derive(seed, &profile_id)));
        if state.offline.contains(&Channel::Power) {
            return Err(SensorError::Offline {
                device: device.to_string(),
                channel: Channel::Power,
            });
        }
        let base = state.profile.power.base;
        state.ticks[tick_index(Channel::Power)] = 0;
        if state.synchronized {
            state.phase = 0.0;
            state.trace_offset = base * 0.005 * noise_scale * gaussian(rng);
        } else {
            state.phase = rng.random_range(0.0..TAU);
            state.trace_offset = base * 0.02 * noise_scale * gaussian(rng);
        }
        Ok(())
    }

    /// Simulated operation clock: the profile's duration plus jitter, so
    /// results do not depend on the host scheduler.
    fn time_operation(&self, device: &str, operation: &str) -> Result<f64, SensorError> {
        self.trigger_operation(device, operation)?;
        let noise_scale = self.noise_scale;
        let mut inner = self.lock();
        let Inner { rng, devices, .. } = &mut *inner;
        let profile = devices
            .get(device)
            .map(|state| (state.profile.op_micros, state.profile.op_jitter))
            .ok_or_else(|| SensorError::UnknownDevice(device.to_string()))?;
        Ok((profile.0 + profile.1 * noise_scale * gaussian(rng)).max(0.0))
    }
}
