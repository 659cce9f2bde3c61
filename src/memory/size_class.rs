use super::error::PoolError;

/// One segment of the size-class progression: classes grow by `step` bytes
/// until they reach `limit` (inclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassTier {
    pub step: usize,
    pub limit: usize,
}

impl SizeClassTier {
    #[must_use]
    pub const fn new(step: usize, limit: usize) -> Self {
        Self { step, limit }
    }
}

/// Default progression: 4-byte steps to 96, 32-byte steps to 512, 64-byte
/// steps to 1024. 45 classes.
pub const DEFAULT_TIERS: [SizeClassTier; 3] = [
    SizeClassTier::new(4, 96),
    SizeClassTier::new(32, 512),
    SizeClassTier::new(64, 1024),
];

/// Expand tiers into an ascending list of class sizes.
///
/// Each tier continues from where the previous one stopped, so the first class
/// of a tier is `previous_limit + step`. A tier whose limit is not reachable in
/// whole steps is rejected.
///
/// # Errors
///
/// Returns `PoolError::InvalidSizeClasses` for an empty progression, a zero
/// step, a limit that does not advance, or a limit off the step grid.
pub fn generate_classes(tiers: &[SizeClassTier]) -> Result<Vec<usize>, PoolError> {
    if tiers.is_empty() {
        return Err(PoolError::InvalidSizeClasses(
            "at least one tier is required".to_string(),
        ));
    }

    let mut classes = Vec::new();
    let mut current = 0usize;
    for (i, tier) in tiers.iter().enumerate() {
        if tier.step == 0 {
            return Err(PoolError::InvalidSizeClasses(format!(
                "tier {i} has a zero step"
            )));
        }
        if tier.limit <= current {
            return Err(PoolError::InvalidSizeClasses(format!(
                "tier {i} limit {} does not exceed previous limit {current}",
                tier.limit
            )));
        }
        if !(tier.limit - current).is_multiple_of(tier.step) {
            return Err(PoolError::InvalidSizeClasses(format!(
                "tier {i} limit {} is not reachable from {current} in steps of {}",
                tier.limit, tier.step
            )));
        }
        while current < tier.limit {
            current += tier.step;
            classes.push(current);
        }
    }

    if classes.len() > usize::from(u8::MAX) + 1 {
        return Err(PoolError::InvalidSizeClasses(format!(
            "{} classes exceed the lookup table's 256-class limit",
            classes.len()
        )));
    }
    Ok(classes)
}

/// Ascending class sizes plus an O(1) byte-count to class-index table.
///
/// `lookup[n]` is the index of the smallest class `>= n` for every `n` in
/// `0..=max_class()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeClassTable {
    classes: Vec<usize>,
    lookup: Vec<u8>,
}

impl SizeClassTable {
    /// Build the table from a tier progression.
    ///
    /// # Errors
    ///
    /// Propagates [`generate_classes`] errors.
    pub fn new(tiers: &[SizeClassTier]) -> Result<Self, PoolError> {
        let classes = generate_classes(tiers)?;
        let max_class = *classes.last().unwrap_or(&0);

        let mut lookup = Vec::with_capacity(max_class + 1);
        let mut class = 0usize;
        for n in 0..=max_class {
            while classes[class] < n {
                class += 1;
            }
            // generate_classes caps the class count at 256.
            #[allow(clippy::cast_possible_truncation)]
            lookup.push(class as u8);
        }

        Ok(Self { classes, lookup })
    }

    #[must_use]
    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Largest configured class; requests above this go to the heap.
    #[must_use]
    pub fn max_class(&self) -> usize {
        self.lookup.len() - 1
    }

    /// Index of the smallest class that can hold `size` bytes, or `None` when
    /// `size` exceeds the largest class.
    #[inline]
    #[must_use]
    pub fn class_index(&self, size: usize) -> Option<usize> {
        self.lookup.get(size).map(|&idx| usize::from(idx))
    }

    /// Class size for an index.
    #[inline]
    #[must_use]
    pub fn class_size(&self, index: usize) -> usize {
        self.classes[index]
    }
}
