use std::fmt::Write as _;

/// Point-in-time snapshot of scheduler counters, rendered as the XML wire
/// fragment described in the governing specification's §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub depth: u64,
    pub max_depth_ever: u64,
    pub workers: u32,
    pub idle: u32,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub capacity_limited_events: u64,
}

impl SchedulerStats {
    /// `<stats id="sched"><jobs>T</jobs><inq>D</inq><maxinq>Mx</maxinq>
    /// <threads>W</threads><idle>I</idle><tcr>C</tcr><tde>X</tde>
    /// <tlimr>L</tlimr></stats>`
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(Self::max_xml_len());
        let _ = write!(
            out,
            "<stats id=\"sched\"><jobs>{}</jobs><inq>{}</inq><maxinq>{}</maxinq>\
<threads>{}</threads><idle>{}</idle><tcr>{}</tcr><tde>{}</tde><tlimr>{}</tlimr></stats>",
            self.total_submitted,
            self.depth,
            self.max_depth_ever,
            self.workers,
            self.idle,
            self.total_created,
            self.total_destroyed,
            self.capacity_limited_events,
        );
        out
    }

    /// Exact upper bound on `to_xml()`'s length: every numeric field rendered
    /// at its maximum decimal width, plus the fixed tag text. Replaces the
    /// `sizeof()+16*8` heuristic of the original C++ with a tight count.
    pub fn max_xml_len() -> usize {
        const U64_MAX_DIGITS: usize = 20;
        const U32_MAX_DIGITS: usize = 10;
        let tag_text = "<stats id=\"sched\"></stats>\
<jobs></jobs><inq></inq><maxinq></maxinq>\
<threads></threads><idle></idle><tcr></tcr><tde></tde><tlimr></tlimr>"
            .len();
        tag_text + 5 * U64_MAX_DIGITS + 3 * U32_MAX_DIGITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_contains_expected_tags() {
        let stats = SchedulerStats {
            total_submitted: 10,
            depth: 2,
            max_depth_ever: 5,
            workers: 4,
            idle: 1,
            total_created: 4,
            total_destroyed: 0,
            capacity_limited_events: 0,
        };
        let xml = stats.to_xml();
        assert!(xml.starts_with("<stats id=\"sched\">"));
        assert!(xml.contains("<jobs>10</jobs>"));
        assert!(xml.contains("<threads>4</threads>"));
        assert!(xml.len() <= SchedulerStats::max_xml_len());
    }

    #[test]
    fn max_len_bounds_worst_case() {
        let stats = SchedulerStats {
            total_submitted: u64::MAX,
            depth: u64::MAX,
            max_depth_ever: u64::MAX,
            workers: u32::MAX,
            idle: u32::MAX,
            total_created: u64::MAX,
            total_destroyed: u64::MAX,
            capacity_limited_events: u64::MAX,
        };
        assert!(stats.to_xml().len() <= SchedulerStats::max_xml_len());
    }
}
