// Next-token selection for the concrete generation engine.
//
// The chat profile samples with temperature, top-k and nucleus (top-p)
// restriction; the sanity-check profile is plain argmax. Draws come from a
// seeded XorShift stream so a turn can be replayed exactly.

/// Sampling parameters for one generation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// 0.0 = greedy.
    pub temperature: f32,
    /// 0 = no candidate cutoff.
    pub top_k: usize,
    /// 1.0 = no nucleus cutoff.
    pub top_p: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0 || self.top_k == 1
    }
}

const DEFAULT_SEED: u64 = 42;

/// XorShift64 generator.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// A zero seed is bumped to 1; the all-zero state is a fixed point.
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [0, 1) from the top 24 bits.
    pub fn next_f32(&mut self) -> f32 {
        const SCALE: f32 = 1.0 / (1u32 << 24) as f32;
        (self.next_u64() >> 40) as f32 * SCALE
    }
}

/// Index of the largest logit; the first one wins a tie.
pub fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0 as u32
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: u32,
    weight: f32,
}

fn sort_descending(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.weight.total_cmp(&a.weight));
}

/// Turn scaled logits into probabilities in place.
fn softmax(candidates: &mut [Candidate]) {
    let peak = candidates
        .iter()
        .map(|c| c.weight)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0f32;
    for c in candidates.iter_mut() {
        c.weight = (c.weight - peak).exp();
        total += c.weight;
    }
    for c in candidates.iter_mut() {
        c.weight /= total;
    }
}

/// Keep the smallest prefix (by descending probability) whose mass reaches
/// `top_p`, then renormalize. Expects sorted input.
fn keep_nucleus(candidates: &mut Vec<Candidate>, top_p: f32) {
    let mut mass = 0.0f32;
    let keep = candidates
        .iter()
        .position(|c| {
            mass += c.weight;
            mass >= top_p
        })
        .map_or(candidates.len(), |i| i + 1);
    candidates.truncate(keep);

    let kept: f32 = candidates.iter().map(|c| c.weight).sum();
    for c in candidates.iter_mut() {
        c.weight /= kept;
    }
}

/// Walk the cumulative distribution until it passes `r`.
fn draw(candidates: &[Candidate], r: f32) -> u32 {
    let mut mass = 0.0f32;
    candidates
        .iter()
        .find(|c| {
            mass += c.weight;
            r < mass
        })
        .or(candidates.last())
        .map_or(0, |c| c.id)
}

/// Picks tokens for one turn: fixed configuration plus its own RNG stream.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: XorShiftRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = XorShiftRng::new(config.seed.unwrap_or(DEFAULT_SEED));
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Choose the next token id from raw logits. Empty logits yield 0.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        if logits.is_empty() {
            return 0;
        }
        if self.config.is_greedy() {
            return argmax(logits);
        }

        let inv_temp = 1.0 / self.config.temperature;
        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| Candidate {
                id: i as u32,
                weight: l * inv_temp,
            })
            .collect();

        sort_descending(&mut candidates);
        if self.config.top_k > 0 {
            candidates.truncate(self.config.top_k);
        }
        softmax(&mut candidates);
        if self.config.top_p < 1.0 {
            keep_nucleus(&mut candidates, self.config.top_p);
        }

        draw(&candidates, self.rng.next_f32())
    }
}
