use chrono::NaiveDateTime;
use uuid::Uuid;

/// Placeholder order for rows that have not been placed yet.
pub const UNASSIGNED_ORDER: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSlot {
    pub id: Uuid,
    pub current: i32,
    pub requested: Option<i32>,
    pub created_at: NaiveDateTime,
}

/// Renumbers attachments to a gapless `0..n-1` sequence.
///
/// Rows sort by their requested order when one was given, otherwise by their
/// current order; unassigned rows go last. Explicit requests win ties, then
/// `created_at`, then id.
pub fn normalize_order(slots: &[OrderSlot]) -> Vec<(Uuid, i32)> {
    let mut keyed: Vec<(i32, bool, NaiveDateTime, Uuid)> = slots
        .iter()
        .map(|slot| {
            let effective = slot.requested.unwrap_or(slot.current);
            let effective = if effective < 0 { i32::MAX } else { effective };
            (effective, slot.requested.is_none(), slot.created_at, slot.id)
        })
        .collect();
    keyed.sort();

    keyed
        .into_iter()
        .enumerate()
        .map(|(position, (_, _, _, id))| (id, position as i32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn slot(current: i32, requested: Option<i32>, age_secs: i64) -> OrderSlot {
        OrderSlot {
            id: Uuid::new_v4(),
            current,
            requested,
            created_at: Utc::now().naive_utc() - Duration::seconds(age_secs),
        }
    }

    fn positions(slots: &[OrderSlot]) -> Vec<i32> {
        let normalized = normalize_order(slots);
        slots
            .iter()
            .map(|slot| {
                normalized
                    .iter()
                    .find(|(id, _)| *id == slot.id)
                    .map(|(_, order)| *order)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn closes_gaps_left_by_deletions() {
        let slots = vec![slot(0, None, 30), slot(3, None, 20), slot(7, None, 10)];
        assert_eq!(positions(&slots), vec![0, 1, 2]);
    }

    #[test]
    fn unassigned_rows_append_in_creation_order() {
        let slots = vec![
            slot(UNASSIGNED_ORDER, None, 1),
            slot(0, None, 60),
            slot(UNASSIGNED_ORDER, None, 2),
            slot(1, None, 50),
        ];
        assert_eq!(positions(&slots), vec![3, 0, 2, 1]);
    }

    #[test]
    fn explicit_request_wins_a_tie() {
        let slots = vec![slot(0, None, 60), slot(1, None, 50), slot(2, Some(0), 40)];
        assert_eq!(positions(&slots), vec![1, 2, 0]);
    }

    #[test]
    fn new_rows_can_be_placed_explicitly() {
        let slots = vec![
            slot(0, None, 60),
            slot(1, None, 50),
            slot(UNASSIGNED_ORDER, Some(1), 1),
        ];
        assert_eq!(positions(&slots), vec![0, 2, 1]);
    }

    #[test]
    fn output_is_always_a_permutation_of_zero_to_n() {
        let slots = vec![
            slot(5, Some(5), 5),
            slot(5, Some(5), 4),
            slot(UNASSIGNED_ORDER, None, 3),
            slot(2, None, 2),
            slot(40, Some(1), 1),
        ];
        let mut orders: Vec<i32> = normalize_order(&slots)
            .into_iter()
            .map(|(_, order)| order)
            .collect();
        orders.sort();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(normalize_order(&[]).is_empty());
    }
}
