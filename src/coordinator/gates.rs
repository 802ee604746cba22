//! # coordinator::gates — Gate ก่อน / หลัง Advisory
//!
//! - **Hold backoff**: symbol ที่ flat และได้ hold ติดกันหลายรอบ จะถูกข้าม
//!   Advisory ไปอีก `min(2^(n - threshold + 1), max_skip)` รอบ
//! - **Double confirmation**: open ต้องถูกแนะนำฝั่งเดียวกันสองรอบ advised
//!   ติดกันก่อนจะส่ง order

use crate::config::{env_bool, env_u32};
use crate::models::{Action, PositionSide, Recommendation};

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub hold_backoff_enabled:        bool,
    /// hold ติดกันกี่รอบถึงเริ่ม skip
    pub hold_backoff_threshold:      u32,
    /// จำนวนรอบที่ skip ได้มากที่สุด
    pub hold_backoff_max_skip:       u32,
    pub require_double_confirmation: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            hold_backoff_enabled:        true,
            hold_backoff_threshold:      3,
            hold_backoff_max_skip:       1,
            require_double_confirmation: false,
        }
    }
}

impl GateConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hold_backoff_enabled:        env_bool("HOLD_BACKOFF_ENABLED", defaults.hold_backoff_enabled),
            hold_backoff_threshold:      env_u32("HOLD_BACKOFF_THRESHOLD", defaults.hold_backoff_threshold).max(1),
            hold_backoff_max_skip:       env_u32("HOLD_BACKOFF_MAX_SKIP", defaults.hold_backoff_max_skip),
            require_double_confirmation: env_bool("REQUIRE_DOUBLE_CONFIRMATION", defaults.require_double_confirmation),
        }
    }
}

/// State ของ gate ต่อ symbol: อยู่ใน slot ของ symbol นั้น
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateState {
    pub consecutive_holds: u32,
    pub skip_cycles:       u32,
    pub pending_open:      Option<PositionSide>,
}

impl GateState {
    /// true = ข้าม Advisory รอบนี้ (นับถอยหลังไปหนึ่ง)
    pub fn take_skip(&mut self) -> bool {
        if self.skip_cycles == 0 {
            return false;
        }
        self.skip_cycles -= 1;
        true
    }

    /// เรียกทุกรอบที่ได้ Recommendation จาก Advisory
    pub fn observe(&mut self, config: &GateConfig, rec: &Recommendation, flat: bool) {
        if !matches!(rec.action, Action::Open { .. }) {
            self.pending_open = None;
        }

        if !(config.hold_backoff_enabled && flat && rec.is_hold()) {
            self.consecutive_holds = 0;
            return;
        }

        self.consecutive_holds += 1;
        if self.consecutive_holds >= config.hold_backoff_threshold {
            let exponent = self.consecutive_holds - config.hold_backoff_threshold + 1;
            let skip = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
            self.skip_cycles = skip.min(config.hold_backoff_max_skip);
        }
    }

    /// true = open ฝั่งนี้ผ่านการยืนยันแล้ว ส่งได้
    pub fn confirm_open(&mut self, config: &GateConfig, side: PositionSide) -> bool {
        if !config.require_double_confirmation {
            return true;
        }
        if self.pending_open == Some(side) {
            self.pending_open = None;
            true
        } else {
            self.pending_open = Some(side);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold() -> Recommendation {
        Recommendation::hold("BTC/USDT", "quiet")
    }

    fn open(side: PositionSide) -> Recommendation {
        Recommendation::new(
            "BTC/USDT",
            Action::Open { side, size: 0.01, leverage: 10, stop_loss_pct: None, take_profit_pct: None },
            0.8,
            "",
        )
    }

    #[test]
    fn test_hold_backoff_after_threshold() {
        let config = GateConfig { hold_backoff_max_skip: 4, ..GateConfig::default() };
        let mut gate = GateState::default();

        gate.observe(&config, &hold(), true);
        gate.observe(&config, &hold(), true);
        assert_eq!(gate.skip_cycles, 0);

        gate.observe(&config, &hold(), true);
        assert_eq!(gate.skip_cycles, 2);
        assert!(gate.take_skip());
        assert!(gate.take_skip());
        assert!(!gate.take_skip());

        gate.observe(&config, &hold(), true);
        assert_eq!(gate.skip_cycles, 4);
    }

    #[test]
    fn test_backoff_capped_by_max_skip() {
        let config = GateConfig::default();
        let mut gate = GateState::default();
        for _ in 0..6 {
            gate.observe(&config, &hold(), true);
        }
        assert_eq!(gate.skip_cycles, 1);
    }

    #[test]
    fn test_backoff_ignores_open_positions_and_resets() {
        let config = GateConfig::default();
        let mut gate = GateState::default();
        for _ in 0..5 {
            gate.observe(&config, &hold(), false);
        }
        assert_eq!(gate.skip_cycles, 0);

        gate.observe(&config, &hold(), true);
        gate.observe(&config, &hold(), true);
        gate.observe(&config, &open(PositionSide::Long), true);
        assert_eq!(gate.consecutive_holds, 0);
    }

    #[test]
    fn test_double_confirmation() {
        let config = GateConfig { require_double_confirmation: true, ..GateConfig::default() };
        let mut gate = GateState::default();

        assert!(!gate.confirm_open(&config, PositionSide::Long));
        assert!(gate.confirm_open(&config, PositionSide::Long));

        // ฝั่งเปลี่ยน → เริ่มนับใหม่
        assert!(!gate.confirm_open(&config, PositionSide::Long));
        assert!(!gate.confirm_open(&config, PositionSide::Short));

        // hold คั่นกลาง → ล้าง pending
        gate.observe(&config, &hold(), true);
        assert!(!gate.confirm_open(&config, PositionSide::Short));
    }

    #[test]
    fn test_confirmation_disabled_passes_immediately() {
        let mut gate = GateState::default();
        assert!(gate.confirm_open(&GateConfig::default(), PositionSide::Short));
    }
}
