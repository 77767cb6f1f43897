// =============================================================================
// Side selection — (direction, trade_type, is_reverse_strategy) -> side|skip
// =============================================================================
//
// Pure table lookup, spec §4.6. A `None` result is a deliberate skip, not an
// error — callers log it at info level and move on.
// =============================================================================

use tracing::info;

use crate::types::{Direction, Side, TradeType};

pub fn select_side(
    direction: Direction,
    trade_type: TradeType,
    is_reverse_strategy: bool,
) -> Option<Side> {
    use Direction::{Bearish, Bullish};
    use Side::{Long, Short};
    use TradeType::{Both, Long as TLong, Short as TShort};

    let side = match (direction, trade_type, is_reverse_strategy) {
        (Bullish, TLong, false) => Some(Long),
        (Bullish, TShort, false) => None,
        (Bullish, Both, false) => Some(Long),
        (Bearish, TLong, false) => None,
        (Bearish, TShort, false) => Some(Short),
        (Bearish, Both, false) => Some(Short),
        (Bullish, TLong, true) => None,
        (Bullish, TShort, true) => Some(Short),
        (Bullish, Both, true) => Some(Short),
        (Bearish, TLong, true) => Some(Long),
        (Bearish, TShort, true) => None,
        (Bearish, Both, true) => Some(Long),
    };

    if side.is_none() {
        info!(?direction, ?trade_type, is_reverse_strategy, "side selection skip");
    }
    side
}

#[cfg(test)]
mod tests {
    use super::*;
    use Direction::{Bearish, Bullish};
    use Side::{Long, Short};
    use TradeType::{Both, Long as TLong, Short as TShort};

    #[test]
    fn matches_spec_table_exactly() {
        let cases = [
            (Bullish, TLong, false, Some(Long)),
            (Bullish, TShort, false, None),
            (Bullish, Both, false, Some(Long)),
            (Bearish, TLong, false, None),
            (Bearish, TShort, false, Some(Short)),
            (Bearish, Both, false, Some(Short)),
            (Bullish, TLong, true, None),
            (Bullish, TShort, true, Some(Short)),
            (Bullish, Both, true, Some(Short)),
            (Bearish, TLong, true, Some(Long)),
            (Bearish, TShort, true, None),
            (Bearish, Both, true, Some(Long)),
        ];
        for (direction, trade_type, is_reverse, expected) in cases {
            assert_eq!(select_side(direction, trade_type, is_reverse), expected);
        }
    }

    #[test]
    fn idempotent_under_repeated_application() {
        let first = select_side(Bullish, Both, true);
        let second = select_side(Bullish, Both, true);
        assert_eq!(first, second);
    }
}
