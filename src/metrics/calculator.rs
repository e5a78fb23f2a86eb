//! Performance summary over the closed trades in the history table.

use statrs::statistics::Statistics;

use crate::db::StoredTrade;

/// Aggregate figures for a set of closed trades.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStats {
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,

    /// Winning share, 0.0..=1.0
    pub win_rate: f64,

    /// Sum of quote PNL
    pub total_pnl: f64,

    /// Mean PNL per trade in percent
    pub avg_pnl_pct: f64,

    /// Sample standard deviation of PNL percent; 0.0 below two trades
    pub pnl_pct_std_dev: f64,

    pub best_pnl_pct: f64,
    pub worst_pnl_pct: f64,

    /// Gross profit over gross loss; infinite with no losing trade
    pub profit_factor: f64,

    /// Largest peak-to-trough drop of cumulative quote PNL
    pub max_drawdown: f64,
}

impl HistoryStats {
    /// Summarize closed trades, given oldest first. Rows without PNL count
    /// as flat.
    pub fn from_trades(trades: &[StoredTrade]) -> Self {
        let mut stats = Self::default();
        if trades.is_empty() {
            return stats;
        }

        let pnl_pcts: Vec<f64> = trades.iter().map(|t| t.pnl_percent.unwrap_or(0.0)).collect();
        let pnl_quotes: Vec<f64> = trades.iter().map(|t| t.pnl_usdt.unwrap_or(0.0)).collect();

        stats.closed_trades = trades.len();
        stats.winning_trades = pnl_quotes.iter().filter(|p| **p > 0.0).count();
        stats.losing_trades = pnl_quotes.iter().filter(|p| **p < 0.0).count();
        stats.win_rate = stats.winning_trades as f64 / stats.closed_trades as f64;
        stats.total_pnl = pnl_quotes.iter().sum();

        stats.avg_pnl_pct = pnl_pcts.iter().mean();
        if pnl_pcts.len() >= 2 {
            stats.pnl_pct_std_dev = pnl_pcts.iter().std_dev();
        }
        stats.best_pnl_pct = pnl_pcts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        stats.worst_pnl_pct = pnl_pcts.iter().copied().fold(f64::INFINITY, f64::min);

        // Profit factor
        let gross_profit: f64 = pnl_quotes.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = pnl_quotes.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
        stats.profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        stats.max_drawdown = Self::max_drawdown(&pnl_quotes);
        stats
    }

    fn max_drawdown(pnls: &[f64]) -> f64 {
        let mut equity = 0.0f64;
        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;

        for pnl in pnls {
            equity += pnl;
            peak = peak.max(equity);
            max_dd = max_dd.max(peak - equity);
        }

        max_dd
    }
}

impl std::fmt::Display for HistoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^50}", " TRADE HISTORY ")?;
        if self.closed_trades == 0 {
            writeln!(f, "No closed trades yet")?;
            return writeln!(f, "{:=^50}", "");
        }

        writeln!(f, "Closed Trades:    {}", self.closed_trades)?;
        writeln!(
            f,
            "Win Rate:         {:.1}% ({}W / {}L)",
            self.win_rate * 100.0,
            self.winning_trades,
            self.losing_trades
        )?;
        writeln!(f, "Total P&L:        ${:.2}", self.total_pnl)?;
        writeln!(f, "Avg P&L:          {:.2}% (σ {:.2})", self.avg_pnl_pct, self.pnl_pct_std_dev)?;
        writeln!(f, "Best / Worst:     {:.2}% / {:.2}%", self.best_pnl_pct, self.worst_pnl_pct)?;
        if self.profit_factor.is_finite() {
            writeln!(f, "Profit Factor:    {:.2}", self.profit_factor)?;
        } else {
            writeln!(f, "Profit Factor:    ∞")?;
        }
        writeln!(f, "Max Drawdown:     ${:.2}", self.max_drawdown)?;
        writeln!(f, "{:=^50}", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(pnl_percent: f64, pnl_usdt: f64) -> StoredTrade {
        StoredTrade {
            id: 0,
            timestamp: "2024-01-01T00:00:00+00:00".to_string(),
            symbol: "BTC/USDT:USDT".to_string(),
            action: "TP".to_string(),
            entry_price: None,
            exit_price: Some(1.0),
            reason: None,
            pnl_percent: Some(pnl_percent),
            pnl_usdt: Some(pnl_usdt),
        }
    }

    #[test]
    fn test_empty_history() {
        let stats = HistoryStats::from_trades(&[]);
        assert_eq!(stats, HistoryStats::default());
        assert!(stats.to_string().contains("No closed trades"));
    }

    #[test]
    fn test_summary() {
        let trades = vec![closed(10.0, 20.0), closed(-5.0, -10.0), closed(20.0, 30.0), closed(-15.0, -25.0)];
        let stats = HistoryStats::from_trades(&trades);

        assert_eq!(stats.closed_trades, 4);
        assert_eq!(stats.winning_trades, 2);
        assert_eq!(stats.losing_trades, 2);
        assert!((stats.win_rate - 0.5).abs() < 1e-12);
        assert!((stats.total_pnl - 15.0).abs() < 1e-12);
        assert!((stats.avg_pnl_pct - 2.5).abs() < 1e-12);
        assert!(stats.pnl_pct_std_dev > 0.0);
        assert_eq!(stats.best_pnl_pct, 20.0);
        assert_eq!(stats.worst_pnl_pct, -15.0);
        assert!((stats.profit_factor - 50.0 / 35.0).abs() < 1e-12);
        // equity 20, 10, 40, 15: worst drop is 40 -> 15
        assert!((stats.max_drawdown - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_losses_profit_factor() {
        let stats = HistoryStats::from_trades(&[closed(5.0, 1.0)]);
        assert!(stats.profit_factor.is_infinite());
        assert_eq!(stats.pnl_pct_std_dev, 0.0);
        assert_eq!(stats.max_drawdown, 0.0);
    }
}
