//! Hill climbing controller for the thread count goal.
//!
//! The controller keeps a rolling history of (thread count, throughput)
//! samples, perturbs the thread count with a small square wave, and
//! extracts the throughput component at the wave's frequency with the
//! Goertzel algorithm. If throughput moves in phase with the thread
//! count, more threads help and the control setting moves up; out of
//! phase means they hurt and it moves down. Noise in the two adjacent
//! frequency bands scales the confidence in each move.

use super::queue::FastRand;

use std::f64::consts::PI;

/// Tuning constants for the controller. The defaults are the values the
/// algorithm has been shipping with for years; changing them is only
/// useful for experiments.
#[derive(Clone, Debug)]
pub struct ClimbingConfig {
    /// Length of the square-wave perturbation, in samples.
    pub wave_period: u32,
    pub max_wave_magnitude: u32,
    pub wave_magnitude_multiplier: f64,
    /// History size, in number of full wave periods.
    pub wave_history_size: u32,
    pub target_throughput_ratio: f64,
    pub target_signal_to_noise_ratio: f64,
    pub max_change_per_second: f64,
    pub max_change_per_sample: f64,
    pub sample_interval_ms_low: u32,
    pub sample_interval_ms_high: u32,
    pub error_smoothing_factor: f64,
    pub gain_exponent: f64,
    pub max_sample_error: f64,
}

const DEFAULT_SAMPLE_INTERVAL_MS_LOW: u32 = 10;
const DEFAULT_SAMPLE_INTERVAL_MS_HIGH: u32 = 200;

impl Default for ClimbingConfig {
    fn default() -> Self {
        ClimbingConfig {
            wave_period: 4,
            max_wave_magnitude: 20,
            wave_magnitude_multiplier: 1.0,
            wave_history_size: 8,
            target_throughput_ratio: 0.15,
            target_signal_to_noise_ratio: 3.0,
            max_change_per_second: 4.0,
            max_change_per_sample: 20.0,
            sample_interval_ms_low: DEFAULT_SAMPLE_INTERVAL_MS_LOW,
            sample_interval_ms_high: DEFAULT_SAMPLE_INTERVAL_MS_HIGH,
            error_smoothing_factor: 0.01,
            gain_exponent: 2.0,
            max_sample_error: 0.15,
        }
    }
}

#[derive(Copy, Clone, Default)]
struct Complex {
    real: f64,
    imaginary: f64,
}

impl Complex {
    fn new(real: f64, imaginary: f64) -> Self {
        Complex { real, imaginary }
    }

    fn abs(self) -> f64 {
        (self.real * self.real + self.imaginary * self.imaginary).sqrt()
    }

    fn scale(self, scalar: f64) -> Self {
        Complex::new(self.real * scalar, self.imaginary * scalar)
    }

    fn div_scalar(self, scalar: f64) -> Self {
        Complex::new(self.real / scalar, self.imaginary / scalar)
    }

    fn sub(self, rhs: Complex) -> Self {
        Complex::new(self.real - rhs.real, self.imaginary - rhs.imaginary)
    }

    fn div(self, rhs: Complex) -> Self {
        let denom = rhs.real * rhs.real + rhs.imaginary * rhs.imaginary;
        Complex::new(
            (self.real * rhs.real + self.imaginary * rhs.imaginary) / denom,
            (-self.real * rhs.imaginary + self.imaginary * rhs.real) / denom,
        )
    }
}

pub(crate) struct HillClimbing {
    config: ClimbingConfig,
    min_threads: i32,
    max_threads: i32,

    samples_to_measure: usize,
    current_control_setting: f64,
    total_samples: i64,
    last_thread_count: i32,
    average_throughput_noise: f64,
    accumulated_completion_count: i32,
    accumulated_sample_duration_seconds: f64,
    samples: Vec<f64>,
    thread_counts: Vec<f64>,
    current_sample_ms: u32,
    rand: FastRand,

    /// Completion total at the time of the last applied sample; the
    /// completion path uses this to compute per-sample deltas.
    pub completions_at_last_sample: u64,
}

impl HillClimbing {
    pub fn new(config: ClimbingConfig, min_threads: u16, max_threads: u16, seed: u32) -> Self {
        let config = ClimbingConfig {
            // Fall back to the defaults if the interval bounds are crossed.
            sample_interval_ms_low: if config.sample_interval_ms_low <= config.sample_interval_ms_high {
                config.sample_interval_ms_low
            } else {
                DEFAULT_SAMPLE_INTERVAL_MS_LOW
            },
            sample_interval_ms_high: if config.sample_interval_ms_low <= config.sample_interval_ms_high {
                config.sample_interval_ms_high
            } else {
                DEFAULT_SAMPLE_INTERVAL_MS_HIGH
            },
            ..config
        };

        let samples_to_measure = (config.wave_period * config.wave_history_size) as usize;
        let mut rand = FastRand::new(seed);
        let current_sample_ms = config.sample_interval_ms_low
            + rand.next_max(config.sample_interval_ms_high - config.sample_interval_ms_low + 1);

        HillClimbing {
            min_threads: min_threads as i32,
            max_threads: max_threads as i32,
            samples_to_measure,
            current_control_setting: 0.0,
            total_samples: 0,
            last_thread_count: 0,
            average_throughput_noise: 0.0,
            accumulated_completion_count: 0,
            accumulated_sample_duration_seconds: 0.0,
            samples: vec![0.0; samples_to_measure],
            thread_counts: vec![0.0; samples_to_measure],
            current_sample_ms,
            rand,
            completions_at_last_sample: 0,
            config,
        }
    }

    pub fn current_sample_interval_ms(&self) -> u32 {
        self.current_sample_ms
    }

    /// Feeds one sample to the controller. Returns the new thread count
    /// goal and the next sample interval in milliseconds.
    pub fn update(
        &mut self,
        current_thread_count: i32,
        mut sample_duration_seconds: f64,
        mut num_completions: i32,
        cpu_utilization: u32,
        high_cpu_threshold: u32,
    ) -> (i32, u32) {
        // If someone changed the thread count without telling us, update
        // our records accordingly.
        if current_thread_count != self.last_thread_count {
            self.force_change(current_thread_count);
        }

        // Add in any data we've already collected about this sample.
        sample_duration_seconds += self.accumulated_sample_duration_seconds;
        num_completions += self.accumulated_completion_count;

        // Since we only count completions, each sample is off by up to
        // +/- (threadCount - 1) work items, and that error accumulates
        // between samples in exactly the frequency range the wave
        // analysis looks at. Reject (accumulate) samples where that
        // error is too large relative to the completion count.
        if self.total_samples > 0
            && (current_thread_count as f64 - 1.0) / num_completions as f64
                >= self.config.max_sample_error
        {
            // Not accurate enough yet, collect a little more.
            self.accumulated_sample_duration_seconds = sample_duration_seconds;
            self.accumulated_completion_count = num_completions;
            return (current_thread_count, 10);
        }

        self.accumulated_sample_duration_seconds = 0.0;
        self.accumulated_completion_count = 0;

        // Add the current thread count and throughput sample to our history.
        let throughput = num_completions as f64 / sample_duration_seconds;
        let sample_index = (self.total_samples % self.samples_to_measure as i64) as usize;
        self.samples[sample_index] = throughput;
        self.thread_counts[sample_index] = current_thread_count as f64;
        self.total_samples += 1;

        let mut ratio = Complex::default();
        let mut confidence = 0.0;

        let wave_period = self.config.wave_period as i64;
        // The number of samples used must be a whole multiple of the wave
        // period, otherwise the target frequency falls between two bands
        // of the analysis.
        let sample_count = ((self.total_samples - 1).min(self.samples_to_measure as i64)
            / wave_period
            * wave_period) as usize;

        if sample_count > wave_period as usize {
            // Average the throughput and thread count samples, so we can
            // scale the wave magnitudes later.
            let mut sample_sum = 0.0;
            let mut thread_sum = 0.0;
            for i in 0..sample_count {
                sample_sum += self.samples[self.history_index(sample_count, i)];
                thread_sum += self.thread_counts[self.history_index(sample_count, i)];
            }
            let average_throughput = sample_sum / sample_count as f64;
            let average_thread_count = thread_sum / sample_count as f64;

            if average_throughput > 0.0 && average_thread_count > 0.0 {
                // The two adjacent frequency bands, used to estimate noise.
                let period = self.config.wave_period as f64;
                let adjacent_period_1 =
                    sample_count as f64 / (sample_count as f64 / period + 1.0);
                let adjacent_period_2 =
                    sample_count as f64 / (sample_count as f64 / period - 1.0);

                let throughput_wave = self
                    .wave_component(WaveSource::Throughput, sample_count, period)
                    .div_scalar(average_throughput);
                let mut throughput_error_estimate = self
                    .wave_component(WaveSource::Throughput, sample_count, adjacent_period_1)
                    .div_scalar(average_throughput)
                    .abs();
                if adjacent_period_2 <= sample_count as f64 {
                    throughput_error_estimate = throughput_error_estimate.max(
                        self.wave_component(WaveSource::Throughput, sample_count, adjacent_period_2)
                            .div_scalar(average_throughput)
                            .abs(),
                    );
                }

                // Thread counts are exact measurements, no noise there.
                let thread_wave = self
                    .wave_component(WaveSource::ThreadCount, sample_count, period)
                    .div_scalar(average_thread_count);

                if self.average_throughput_noise == 0.0 {
                    self.average_throughput_noise = throughput_error_estimate;
                } else {
                    let smoothing = self.config.error_smoothing_factor;
                    self.average_throughput_noise = smoothing * throughput_error_estimate
                        + (1.0 - smoothing) * self.average_throughput_noise;
                }

                if thread_wave.abs() > 0.0 {
                    // Center the throughput wave around the target, then
                    // take the throughput/thread ratio.
                    ratio = throughput_wave
                        .sub(thread_wave.scale(self.config.target_throughput_ratio))
                        .div(thread_wave);
                } else {
                    ratio = Complex::new(0.0, 0.0);
                }

                // More noise means less confidence, which slows down
                // moves that might just be chasing randomness.
                let noise_for_confidence =
                    self.average_throughput_noise.max(throughput_error_estimate);
                confidence = if noise_for_confidence > 0.0 {
                    (thread_wave.abs() / noise_for_confidence)
                        / self.config.target_signal_to_noise_ratio
                } else {
                    1.0
                };
            }
        }

        // Only the real part matters: in phase moves us up, 180 degrees
        // out of phase moves us down, 90 degrees gives no information.
        let mut move_amount = ratio.real.clamp(-1.0, 1.0);
        move_amount *= confidence.clamp(0.0, 1.0);

        // Non-linear gain attenuates values near zero and enhances the
        // larger ones: fast ramp-up far from the target, no wild
        // oscillation close to it.
        let gain = self.config.max_change_per_second * sample_duration_seconds;
        move_amount =
            move_amount.abs().powf(self.config.gain_exponent) * move_amount.signum() * gain;
        move_amount = move_amount.min(self.config.max_change_per_sample);

        // A positive move with the CPU already saturated is refused.
        if move_amount > 0.0 && cpu_utilization > high_cpu_threshold {
            move_amount = 0.0;
        }

        self.current_control_setting += move_amount;

        // The wave magnitude scales with the throughput noise average,
        // which starts at zero, so the wave starts small.
        let mut new_wave_magnitude = (0.5
            + self.current_control_setting
                * self.average_throughput_noise
                * self.config.target_signal_to_noise_ratio
                * self.config.wave_magnitude_multiplier
                * 2.0) as i32;
        new_wave_magnitude = new_wave_magnitude.min(self.config.max_wave_magnitude as i32).max(1);

        self.current_control_setting = self
            .current_control_setting
            .min((self.max_threads - new_wave_magnitude) as f64)
            .max(self.min_threads as f64);

        // New thread count = control setting + square wave.
        let wave_phase = (self.total_samples / (wave_period / 2)) % 2;
        let mut new_thread_count =
            (self.current_control_setting + (new_wave_magnitude * wave_phase as i32) as f64) as i32;
        new_thread_count = new_thread_count.clamp(self.min_threads, self.max_threads);

        if new_thread_count != current_thread_count {
            self.change_thread_count(new_thread_count);
        }

        // The sample interval is randomized to avoid correlating with
        // periodic changes in the workload. When pinned at the minimum
        // with a negative ratio there is no lower value to try, so stay
        // there much longer and only occasionally probe higher.
        let new_sample_interval = if ratio.real < 0.0 && new_thread_count == self.min_threads {
            (0.5 + self.current_sample_ms as f64 * (10.0 * (-ratio.real).max(1.0))) as u32
        } else {
            self.current_sample_ms
        };

        (new_thread_count, new_sample_interval)
    }

    /// Tells the controller about a thread count change it did not
    /// decide itself (starvation recovery, spawn failure).
    pub fn force_change(&mut self, new_thread_count: i32) {
        if self.last_thread_count != new_thread_count {
            self.current_control_setting += (new_thread_count - self.last_thread_count) as f64;
            self.change_thread_count(new_thread_count);
        }
    }

    fn change_thread_count(&mut self, new_thread_count: i32) {
        self.last_thread_count = new_thread_count;
        let low = self.config.sample_interval_ms_low;
        let high = self.config.sample_interval_ms_high;
        self.current_sample_ms = low + self.rand.next_max(high - low + 1);
    }

    fn history_index(&self, sample_count: usize, i: usize) -> usize {
        ((self.total_samples - sample_count as i64 + i as i64)
            % self.samples_to_measure as i64) as usize
    }

    /// Single frequency component of the sample history, via the
    /// Goertzel algorithm.
    fn wave_component(&self, source: WaveSource, num_samples: usize, period: f64) -> Complex {
        debug_assert!(num_samples as f64 >= period); // can't measure a wave that doesn't fit
        debug_assert!(period >= 2.0); // can't measure above the Nyquist frequency
        debug_assert!(num_samples <= self.samples_to_measure);

        let history = match source {
            WaveSource::Throughput => &self.samples,
            WaveSource::ThreadCount => &self.thread_counts,
        };

        let w = 2.0 * PI / period;
        let cos = w.cos();
        let coeff = 2.0 * cos;
        let mut q1 = 0.0;
        let mut q2 = 0.0;
        for i in 0..num_samples {
            let q0 = coeff * q1 - q2 + history[self.history_index(num_samples, i)];
            q2 = q1;
            q1 = q0;
        }

        Complex::new(q1 - q2 * cos, q2 * w.sin()).div_scalar(num_samples as f64)
    }
}

enum WaveSource {
    Throughput,
    ThreadCount,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(min: u16, max: u16) -> HillClimbing {
        HillClimbing::new(ClimbingConfig::default(), min, max, 42)
    }

    #[test]
    fn stays_within_bounds() {
        let mut hc = controller(2, 16);

        // Feed a plausible stream of samples with throughput that keeps
        // improving with thread count; the goal must stay in bounds.
        let mut threads = 2;
        for i in 0..500 {
            let completions = 100 + threads * 50 + (i % 7) as i32;
            let (new_threads, interval) = hc.update(threads, 0.05, completions, 30, 95);
            assert!(new_threads >= 2 && new_threads <= 16, "goal {} out of bounds", new_threads);
            assert!(interval >= 1);
            threads = new_threads;
        }
    }

    #[test]
    fn high_cpu_refuses_growth() {
        let mut hc = controller(1, 64);

        let mut threads = 4;
        for i in 0..500 {
            let completions = 100 + threads * 50 + (i % 7) as i32;
            let (new_threads, _) = hc.update(threads, 0.05, completions, 99, 95);
            // All positive moves are refused, the wave magnitude alone
            // can only push one magnitude above the starting control
            // setting which is itself capped at the current count.
            assert!(new_threads <= threads.max(hc.min_threads) + hc.config.max_wave_magnitude as i32);
            threads = new_threads;
        }
    }

    #[test]
    fn inaccurate_samples_accumulate() {
        let mut hc = controller(1, 16);
        // Prime with one good sample so total_samples > 0.
        hc.update(8, 0.05, 1000, 30, 95);

        // 8 threads and only 10 completions: (8 - 1) / 10 > 0.15, the
        // sample is rejected and the controller asks for a quick retry.
        let (threads, interval) = hc.update(8, 0.05, 10, 30, 95);
        assert_eq!(threads, 8);
        assert_eq!(interval, 10);
    }

    #[test]
    fn force_change_tracks_external_moves() {
        let mut hc = controller(1, 32);
        hc.update(4, 0.05, 1000, 30, 95);

        hc.force_change(9);
        // The next update must not re-issue a force for the same count.
        let (threads, _) = hc.update(9, 0.05, 1000, 30, 95);
        assert!(threads >= 1 && threads <= 32);
    }

    #[test]
    fn interval_is_randomized_in_range() {
        let mut hc = controller(1, 8);
        for _ in 0..50 {
            hc.change_thread_count(3);
            let interval = hc.current_sample_interval_ms();
            assert!((10..=200).contains(&interval));
        }
    }
}
