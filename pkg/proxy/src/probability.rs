/// Memoised `--probability` arguments.
///
/// Rule `i` of `n` load-balancing rules matches with probability
/// `1/(n - i)`, which spreads traffic evenly once earlier rules have had
/// their chance.
#[derive(Debug, Default)]
pub struct ProbabilityTable {
    // Index 0 is never handed out.
    cache: Vec<String>,
}

impl ProbabilityTable {
    pub fn new() -> Self {
        Self {
            cache: vec![String::new()],
        }
    }

    /// `1/n` to five decimals. `n` must be at least 1.
    pub fn get(&mut self, n: usize) -> &str {
        let n = n.max(1);
        if self.cache.is_empty() {
            self.cache.push(String::new());
        }
        while self.cache.len() <= n {
            let next = self.cache.len();
            self.cache.push(format!("{:.5}", 1.0 / next as f64));
        }
        &self.cache[n]
    }

    /// Largest `n` computed so far.
    pub fn len(&self) -> usize {
        self.cache.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
