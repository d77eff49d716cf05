//! Frequency-band level metering
//!
//! Keeps a bounded window of recent mono samples, measures the energy in a set
//! of log-spaced frequency bands with the Goertzel algorithm, and smooths the
//! result with an exponential moving average. Analysis only reads the window;
//! it never touches the chunking path.

use std::collections::VecDeque;

/// Number of frequency bands reported
pub const NUM_BANDS: usize = 16;

/// Analysis window (~64ms at 16kHz)
const WINDOW_CAPACITY: usize = 1024;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

const LOWEST_BAND_HZ: f32 = 80.0;
const HIGHEST_BAND_HZ: f32 = 8_000.0;

/// Smoothed band levels, each normalized to 0.0-1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub bands: [f32; NUM_BANDS],
}

impl Levels {
    pub fn silent() -> Self {
        Self {
            bands: [0.0; NUM_BANDS],
        }
    }

    /// Loudest band
    pub fn peak(&self) -> f32 {
        self.bands.iter().copied().fold(0.0, f32::max)
    }
}

/// Centre frequencies, log-spaced and clamped below Nyquist
pub fn band_frequencies(sample_rate: u32) -> [f32; NUM_BANDS] {
    let nyquist = sample_rate as f32 / 2.0;
    let top = HIGHEST_BAND_HZ.min(nyquist * 0.95).max(LOWEST_BAND_HZ);
    let ratio = (top / LOWEST_BAND_HZ).powf(1.0 / (NUM_BANDS - 1) as f32);

    let mut freqs = [0.0f32; NUM_BANDS];
    let mut f = LOWEST_BAND_HZ;
    for slot in freqs.iter_mut() {
        *slot = f;
        f *= ratio;
    }
    freqs
}

/// Normalized magnitude of one frequency over the window
fn goertzel(samples: &VecDeque<i16>, sample_rate: u32, freq: f32) -> f32 {
    let n = samples.len();
    if n == 0 || sample_rate == 0 {
        return 0.0;
    }

    let omega = 2.0 * std::f64::consts::PI * freq as f64 / sample_rate as f64;
    let coeff = 2.0 * omega.cos();
    let (mut s_prev, mut s_prev2) = (0.0f64, 0.0f64);

    for &sample in samples {
        let x = sample as f64 / i16::MAX as f64;
        let s = x + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }

    let power = s_prev2 * s_prev2 + s_prev * s_prev - coeff * s_prev * s_prev2;
    // A full-scale sine at the bin frequency yields magnitude n/2
    let magnitude = power.max(0.0).sqrt() / (n as f64 / 2.0);
    (magnitude as f32).clamp(0.0, 1.0)
}

/// Exponential moving average over the band array
#[derive(Debug, Clone)]
struct EmaState {
    prev: [f32; NUM_BANDS],
    initialized: bool,
}

impl EmaState {
    fn new() -> Self {
        Self {
            prev: [0.0; NUM_BANDS],
            initialized: false,
        }
    }

    fn apply(&mut self, bands: &mut [f32; NUM_BANDS]) {
        if !self.initialized {
            self.prev = *bands;
            self.initialized = true;
            return;
        }

        for (band, prev) in bands.iter_mut().zip(self.prev.iter()) {
            *band = EMA_ALPHA * *band + (1.0 - EMA_ALPHA) * prev;
        }
        self.prev = *bands;
    }

    fn reset(&mut self) {
        self.prev = [0.0; NUM_BANDS];
        self.initialized = false;
    }
}

/// Rolling analyser fed from the capture thread
#[derive(Debug, Clone)]
pub struct LevelMeter {
    window: VecDeque<i16>,
    capacity: usize,
    sample_rate: u32,
    frequencies: [f32; NUM_BANDS],
    ema: EmaState,
    current: Levels,
}

impl LevelMeter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
            capacity: WINDOW_CAPACITY,
            sample_rate,
            frequencies: band_frequencies(sample_rate),
            ema: EmaState::new(),
            current: Levels::silent(),
        }
    }

    /// Add mono samples and refresh the smoothed levels
    pub fn push_samples(&mut self, samples: &[i16]) {
        let len = samples.len();
        if len == 0 {
            return;
        }

        if len >= self.capacity {
            self.window.clear();
            self.window.extend(&samples[len - self.capacity..]);
        } else {
            let to_remove = (self.window.len() + len).saturating_sub(self.capacity);
            if to_remove > 0 {
                self.window.drain(0..to_remove);
            }
            self.window.extend(samples);
        }

        let mut bands = [0.0f32; NUM_BANDS];
        for (band, &freq) in bands.iter_mut().zip(self.frequencies.iter()) {
            *band = goertzel(&self.window, self.sample_rate, freq);
        }
        self.ema.apply(&mut bands);
        self.current = Levels { bands };
    }

    pub fn levels(&self) -> Levels {
        self.current
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.ema.reset();
        self.current = Levels::silent();
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * std::f32::consts::PI * freq * t).sin() * amplitude) as i16
            })
            .collect()
    }

    #[test]
    fn test_window_bounded() {
        let mut meter = LevelMeter::new(16_000);
        meter.push_samples(&vec![100i16; 5_000]);
        assert_eq!(meter.window_len(), WINDOW_CAPACITY);

        meter.push_samples(&[1, 2, 3]);
        assert_eq!(meter.window_len(), WINDOW_CAPACITY);
    }

    #[test]
    fn test_silence_is_zero() {
        let mut meter = LevelMeter::new(16_000);
        meter.push_samples(&vec![0i16; 2_048]);
        assert_eq!(meter.levels(), Levels::silent());
    }

    #[test]
    fn test_tone_lights_its_band() {
        let sample_rate = 16_000;
        let freqs = band_frequencies(sample_rate);
        let target = freqs[8];

        let mut meter = LevelMeter::new(sample_rate);
        meter.push_samples(&sine(target, sample_rate, WINDOW_CAPACITY, 20_000.0));
        let levels = meter.levels();

        let loudest = levels
            .bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(loudest, Some(8));
        for &band in &levels.bands {
            assert!((0.0..=1.0).contains(&band));
        }
    }

    #[test]
    fn test_frequencies_ascend_below_nyquist() {
        for rate in [8_000, 16_000, 48_000] {
            let freqs = band_frequencies(rate);
            for pair in freqs.windows(2) {
                assert!(pair[1] > pair[0]);
            }
            assert!(freqs[NUM_BANDS - 1] < rate as f32 / 2.0);
        }
    }

    #[test]
    fn test_ema_smoothing() {
        let mut ema = EmaState::new();

        let mut first = [0.5f32; NUM_BANDS];
        ema.apply(&mut first);
        assert_eq!(first[0], 0.5);

        let mut second = [1.0f32; NUM_BANDS];
        ema.apply(&mut second);
        let expected = EMA_ALPHA * 1.0 + (1.0 - EMA_ALPHA) * 0.5;
        assert!((second[0] - expected).abs() < 0.001);

        ema.reset();
        let mut third = [0.2f32; NUM_BANDS];
        ema.apply(&mut third);
        assert_eq!(third[0], 0.2);
    }
}
