//! Indicator math - textbook formulas over price/volume series
//!
//! Strategies assume standard numeric semantics: RSI uses Wilder's
//! smoothing, MACD uses exponential averages, Bollinger uses the
//! population standard deviation. Every function returns `None` during
//! warmup rather than guessing.

/// Simple moving average over the trailing `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// EMA series seeded with the SMA of the first `period` values.
/// `result[i]` corresponds to `values[period - 1 + i]`.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(seed);
    let mut prev = seed;
    for value in &values[period..] {
        prev = (value - prev) * k + prev;
        series.push(prev);
    }
    series
}

/// Exponential moving average of the full series.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// RSI with Wilder's smoothing:
/// first average = simple mean over `period` changes, then
/// `avg = (prev_avg * (period - 1) + current) / period`.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let mut gains = Vec::with_capacity(values.len() - 1);
    let mut losses = Vec::with_capacity(values.len() - 1);
    for pair in values.windows(2) {
        let change = pair[1] - pair[0];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;
    for i in period..gains.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD line, signal line and histogram.
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<(f64, f64, f64)> {
    if fast == 0 || slow <= fast || signal == 0 || values.len() < slow + signal - 1 {
        return None;
    }
    let fast_series = ema_series(values, fast);
    let slow_series = ema_series(values, slow);
    // Align both series on the slow EMA's first valid index
    let offset = slow - fast;
    let line_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[i + offset] - s)
        .collect();
    let signal_series = ema_series(&line_series, signal);
    let line = *line_series.last()?;
    let signal_value = *signal_series.last()?;
    Some((line, signal_value, line - signal_value))
}

/// Bollinger bands: SMA middle, +/- `mult` population standard deviations.
pub fn bollinger(values: &[f64], period: usize, mult: f64) -> Option<(f64, f64, f64)> {
    let middle = sma(values, period)?;
    let tail = &values[values.len() - period..];
    let variance = tail.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    Some((middle + mult * sd, middle, middle - mult * sd))
}

/// Volume-weighted average price over the window.
pub fn vwap(prices: &[f64], volumes: &[f64]) -> Option<f64> {
    if prices.is_empty() || prices.len() != volumes.len() {
        return None;
    }
    let total_volume: f64 = volumes.iter().sum();
    if total_volume <= 0.0 {
        return None;
    }
    let weighted: f64 = prices.iter().zip(volumes).map(|(p, v)| p * v).sum();
    Some(weighted / total_volume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sma_trailing_window() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_relative_eq!(sma(&values, 3).unwrap(), 4.0);
        assert!(sma(&values, 6).is_none());
        assert!(sma(&values, 0).is_none());
    }

    #[test]
    fn test_ema_converges_toward_recent_values() {
        let mut values = vec![10.0; 20];
        values.extend(std::iter::repeat(20.0).take(40));
        let ema = ema(&values, 10).unwrap();
        assert!(ema > 19.9, "EMA {} should approach 20", ema);
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_relative_eq!(rsi(&rising, 14).unwrap(), 100.0);

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert_relative_eq!(rsi(&falling, 14).unwrap(), 0.0);
    }

    #[test]
    fn test_rsi_warmup_and_range() {
        assert!(rsi(&[1.0, 2.0], 14).is_none());

        let wave: Vec<f64> = (0..50)
            .map(|i| 100.0 + ((i as f64) * 0.7).sin() * 5.0)
            .collect();
        let value = rsi(&wave, 14).unwrap();
        assert!((0.0..=100.0).contains(&value), "RSI {} out of range", value);
    }

    #[test]
    fn test_rsi_uses_wilder_smoothing() {
        // A single large early loss must decay through smoothing, not drop
        // out of a simple window.
        let mut values: Vec<f64> = vec![100.0, 80.0];
        values.extend((0..30).map(|i| 80.0 + i as f64 * 0.1));
        let smoothed = rsi(&values, 14).unwrap();
        assert!(
            smoothed < 100.0,
            "early loss must still weigh on RSI, got {}",
            smoothed
        );
    }

    #[test]
    fn test_macd_flat_series_is_zero() {
        let flat = vec![42.0; 60];
        let (line, signal, histogram) = macd(&flat, 12, 26, 9).unwrap();
        assert_relative_eq!(line, 0.0);
        assert_relative_eq!(signal, 0.0);
        assert_relative_eq!(histogram, 0.0);
    }

    #[test]
    fn test_macd_positive_in_uptrend() {
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let (line, _, _) = macd(&rising, 12, 26, 9).unwrap();
        assert!(line > 0.0, "MACD line {} should be positive", line);
    }

    #[test]
    fn test_macd_warmup() {
        let short = vec![1.0; 30];
        assert!(macd(&short, 12, 26, 9).is_none());
        assert!(macd(&vec![1.0; 60], 26, 12, 9).is_none());
    }

    #[test]
    fn test_bollinger_known_values() {
        let values = [2.0, 4.0, 6.0, 8.0];
        // mean 5, population variance 5, sd = sqrt(5)
        let (upper, middle, lower) = bollinger(&values, 4, 2.0).unwrap();
        assert_relative_eq!(middle, 5.0);
        assert_relative_eq!(upper, 5.0 + 2.0 * 5.0_f64.sqrt());
        assert_relative_eq!(lower, 5.0 - 2.0 * 5.0_f64.sqrt());
    }

    #[test]
    fn test_vwap_weights_by_volume() {
        let prices = [10.0, 20.0];
        let volumes = [1.0, 3.0];
        assert_relative_eq!(vwap(&prices, &volumes).unwrap(), 17.5);
        assert!(vwap(&prices, &[0.0, 0.0]).is_none());
        assert!(vwap(&prices, &[1.0]).is_none());
    }
}
