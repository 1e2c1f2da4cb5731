use crate::record::VersionedAspect;
use crate::urn::Urn;
use serde::{Deserialize, Serialize};

/// One page of latest-aspect values for an entity type.
///
/// Pages partition a urn-ascending total order, so walking `next_start` in
/// `page_size` steps visits every row exactly once as long as no concurrent
/// writer changes the set. `total_count` and `total_page_count` are computed
/// at query time and may go stale under concurrent writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedAspects {
    pub values: Vec<VersionedAspect>,
    pub next_start: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_page_count: usize,
}

impl ListedAspects {
    pub(crate) fn from_page(
        values: Vec<VersionedAspect>,
        offset: usize,
        limit: usize,
        total_count: usize,
    ) -> Self {
        Self {
            next_start: offset + values.len(),
            page_size: limit,
            total_count,
            total_page_count: page_count(total_count, limit),
            values,
        }
    }

    pub fn is_last_page(&self) -> bool {
        self.next_start >= self.total_count
    }
}

/// One page of distinct entity ids for an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedUrns {
    pub entities: Vec<Urn>,
    pub start: usize,
    pub count: usize,
    pub total: usize,
}

impl ListedUrns {
    pub(crate) fn from_page(entities: Vec<Urn>, start: usize, total: usize) -> Self {
        Self {
            start,
            count: entities.len(),
            total,
            entities,
        }
    }
}

pub(crate) fn page_count(total: usize, limit: usize) -> usize {
    if limit == 0 {
        return 0;
    }
    total.div_ceil(limit)
}

#[cfg(test)]
mod tests {
    use super::{page_count, ListedAspects, ListedUrns};
    use crate::record::{AspectRecord, AuditStamp, SystemMetadata, VersionedAspect};
    use crate::urn::Urn;
    use serde_json::json;

    fn aspect(value: &str) -> VersionedAspect {
        VersionedAspect {
            urn: Urn::parse(&format!("dataset:{value}")).expect("urn"),
            aspect_name: "ownership".into(),
            version: 0,
            record: AspectRecord::new(
                json!({"owner": value}),
                SystemMetadata::for_run("run", 1),
                AuditStamp::new("urn:corpuser:tester", 1),
            ),
        }
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count(0, 2), 0);
        assert_eq!(page_count(1, 2), 1);
        assert_eq!(page_count(2, 2), 1);
        assert_eq!(page_count(3, 2), 2);
        assert_eq!(page_count(4, 2), 2);
    }

    #[test]
    fn aspect_page_math_matches_offset_plus_returned() {
        let page = ListedAspects::from_page(vec![aspect("e1"), aspect("e2")], 0, 2, 3);
        assert_eq!(page.next_start, 2);
        assert_eq!(page.page_size, 2);
        assert_eq!(page.total_count, 3);
        assert_eq!(page.total_page_count, 2);
        assert!(!page.is_last_page());

        let tail = ListedAspects::from_page(vec![aspect("e3")], 2, 2, 3);
        assert_eq!(tail.next_start, 3);
        assert!(tail.is_last_page());
    }

    #[test]
    fn urn_page_reports_start_count_total() {
        let first = ListedUrns::from_page(
            vec![
                Urn::parse("dataset:e1").expect("urn"),
                Urn::parse("dataset:e2").expect("urn"),
            ],
            0,
            3,
        );
        assert_eq!(first.start, 0);
        assert_eq!(first.count, 2);
        assert_eq!(first.total, 3);

        let second = ListedUrns::from_page(vec![Urn::parse("dataset:e3").expect("urn")], 2, 3);
        assert_eq!(second.start, 2);
        assert_eq!(second.count, 1);
        assert_eq!(second.total, 3);
    }
}
