//! Which program stays selected after a reload changed the program list.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramResync {
    pub index: i32,
    /// When true the defaults are re-read and a change is announced.
    /// Otherwise `index` is only re-applied on the backend.
    pub changed: bool,
}

pub fn resync(old_count: usize, new_count: usize, current: i32) -> ProgramResync {
    let (old, new) = (old_count as i64, new_count as i64);
    let cur = current as i64;

    let changed = |index: i64| ProgramResync {
        index: index as i32,
        changed: true,
    };

    if new == old + 1 {
        // Most likely the user just added a program.
        changed(old)
    } else if new > 0 && cur >= new {
        changed(0)
    } else if cur < 0 && new > 0 {
        changed(0)
    } else if cur >= 0 && new == 0 {
        changed(-1)
    } else {
        ProgramResync {
            index: current,
            changed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(old: usize, new: usize, current: i32) -> (i32, bool) {
        let r = resync(old, new, current);
        (r.index, r.changed)
    }

    #[test]
    fn test_first_program_appears() {
        assert_eq!(case(0, 1, -1), (0, true));
    }

    #[test]
    fn test_program_appended() {
        assert_eq!(case(3, 4, 2), (3, true));
    }

    #[test]
    fn test_all_programs_removed() {
        assert_eq!(case(3, 0, 1), (-1, true));
    }

    #[test]
    fn test_same_count_is_silent() {
        assert_eq!(case(3, 3, 1), (1, false));
    }

    #[test]
    fn test_current_out_of_range() {
        assert_eq!(case(8, 4, 6), (0, true));
        assert_eq!(case(5, 2, 2), (0, true));
    }

    #[test]
    fn test_none_selected_gets_first() {
        assert_eq!(case(0, 5, -1), (0, true));
        assert_eq!(case(7, 5, -1), (0, true));
    }

    #[test]
    fn test_empty_stays_empty() {
        assert_eq!(case(0, 0, -1), (-1, false));
        assert_eq!(case(4, 0, -1), (-1, false));
    }
}
