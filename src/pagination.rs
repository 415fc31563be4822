use crate::models::BookSummary;
use serde::Serialize;

pub const LARGE_ROW: usize = 6;
pub const MEDIUM_ROW: usize = 3;
pub const SMALL_ROW: usize = 2;

/// Splits `items` into consecutive rows of `size`; only the last row may be
/// shorter. A zero size yields no rows.
pub fn bucket<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    if size == 0 {
        return Vec::new();
    }
    items.chunks(size).map(|row| row.to_vec()).collect()
}

/// Number of listing pages needed for `total` books at `page_size` per page.
pub fn total_pages(total: u64, page_size: u64) -> u64 {
    if page_size == 0 {
        return 0;
    }
    total.div_ceil(page_size)
}

/// One page of a reader's library, pre-split for each grid density.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryPage {
    pub page: u64,
    pub total_pages: u64,
    pub books: Vec<BookSummary>,
    pub large: Vec<Vec<BookSummary>>,
    pub medium: Vec<Vec<BookSummary>>,
    pub small: Vec<Vec<BookSummary>>,
}

impl LibraryPage {
    pub fn new(page: u64, total_pages: u64, books: Vec<BookSummary>) -> Self {
        Self {
            page,
            total_pages,
            large: bucket(&books, LARGE_ROW),
            medium: bucket(&books, MEDIUM_ROW),
            small: bucket(&books, SMALL_ROW),
            books,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summaries(count: i64) -> Vec<BookSummary> {
        (1..=count)
            .map(|id| BookSummary {
                id,
                title: format!("Book {}", id),
                url: format!("/book/{}.pdf", id),
                cover: String::new(),
            })
            .collect()
    }

    #[test]
    fn rows_concatenate_back_to_input() {
        let items: Vec<u32> = (0..17).collect();
        for size in [1, 2, 3, 6, 18, 40] {
            let rows = bucket(&items, size);
            let flat: Vec<u32> = rows.concat();
            assert_eq!(flat, items);
            let (last, full) = rows.split_last().unwrap();
            assert!(full.iter().all(|row| row.len() == size));
            assert!(!last.is_empty() && last.len() <= size);
        }
    }

    #[test]
    fn empty_list_has_no_rows() {
        assert!(bucket::<u32>(&[], 6).is_empty());
        assert!(bucket(&[1, 2], 0).is_empty());
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(total_pages(37, 18), 3);
        assert_eq!(total_pages(36, 18), 2);
        assert_eq!(total_pages(1, 18), 1);
        assert_eq!(total_pages(0, 18), 0);
    }

    #[test]
    fn library_page_builds_three_densities() {
        let page = LibraryPage::new(1, 1, summaries(7));
        assert_eq!(page.large.len(), 2);
        assert_eq!(page.medium.len(), 3);
        assert_eq!(page.small.len(), 4);
        assert_eq!(page.small[3].len(), 1);
        assert_eq!(page.books.len(), 7);
    }
}
