//! Monotone non-increasing least-squares fit (pool adjacent violators).

/// Fitted step function over the unique x values of the training data.
/// Predictions interpolate linearly between knots and clamp outside them.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotonicFit {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

struct Block {
    sum: f64,
    weight: f64,
    len: usize,
}

impl Block {
    fn mean(&self) -> f64 {
        self.sum / self.weight
    }
}

impl IsotonicFit {
    /// Fit y ≈ f(x) with f non-increasing. Non-finite points are ignored;
    /// returns `None` when nothing usable remains.
    pub fn fit_non_increasing(points: &[(f64, f64)]) -> Option<Self> {
        let mut pts: Vec<(f64, f64)> = points
            .iter()
            .copied()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();
        if pts.is_empty() {
            return None;
        }
        pts.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Collapse duplicate x into one weighted point.
        let mut xs: Vec<f64> = Vec::new();
        let mut blocks: Vec<Block> = Vec::new();
        for (x, y) in pts {
            match (xs.last(), blocks.last_mut()) {
                (Some(last), Some(b)) if *last == x => {
                    b.sum += y;
                    b.weight += 1.0;
                }
                _ => {
                    xs.push(x);
                    blocks.push(Block {
                        sum: y,
                        weight: 1.0,
                        len: 1,
                    });
                }
            }
        }

        let mut stack: Vec<Block> = Vec::with_capacity(blocks.len());
        for block in blocks {
            stack.push(block);
            while stack.len() >= 2 {
                let n = stack.len();
                if stack[n - 2].mean() >= stack[n - 1].mean() {
                    break;
                }
                let Some(top) = stack.pop() else { break };
                if let Some(prev) = stack.last_mut() {
                    prev.sum += top.sum;
                    prev.weight += top.weight;
                    prev.len += top.len;
                }
            }
        }

        let ys = stack
            .iter()
            .flat_map(|b| std::iter::repeat(b.mean()).take(b.len))
            .collect();
        Some(Self { xs, ys })
    }

    pub fn predict(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if n == 1 || x.is_nan() || x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1];
        }
        let hi = self.xs.partition_point(|k| *k < x);
        let lo = hi - 1;
        let (x0, x1) = (self.xs[lo], self.xs[hi]);
        let (y0, y1) = (self.ys[lo], self.ys[hi]);
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }

    /// Fitted (x, y) knots.
    pub fn knots(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.xs.iter().copied().zip(self.ys.iter().copied())
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.xs[0], self.xs[self.xs.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_monotone_is_unchanged() {
        let fit = IsotonicFit::fit_non_increasing(&[(0.0, 3.0), (1.0, 2.0), (2.0, 1.0)]).unwrap();
        let ys: Vec<f64> = fit.knots().map(|(_, y)| y).collect();
        assert_eq!(ys, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_violators_are_pooled() {
        let fit = IsotonicFit::fit_non_increasing(&[(0.0, 1.0), (1.0, 3.0), (2.0, 0.0)]).unwrap();
        let ys: Vec<f64> = fit.knots().map(|(_, y)| y).collect();
        assert_eq!(ys, vec![2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_duplicate_x_averaged() {
        let fit = IsotonicFit::fit_non_increasing(&[(1.0, 0.0), (1.0, 1.0), (2.0, 0.2)]).unwrap();
        assert!((fit.predict(1.0) - 0.5).abs() < 1e-12);
        assert_eq!(fit.knots().count(), 2);
    }

    #[test]
    fn test_predict_interpolates_and_clamps() {
        let fit = IsotonicFit::fit_non_increasing(&[(0.0, 1.0), (2.0, 0.0)]).unwrap();
        assert!((fit.predict(1.0) - 0.5).abs() < 1e-12);
        assert_eq!(fit.predict(-5.0), 1.0);
        assert_eq!(fit.predict(10.0), 0.0);
        assert_eq!(fit.domain(), (0.0, 2.0));
    }

    #[test]
    fn test_empty_input() {
        assert!(IsotonicFit::fit_non_increasing(&[]).is_none());
        assert!(IsotonicFit::fit_non_increasing(&[(f64::NAN, 1.0)]).is_none());
    }
}
