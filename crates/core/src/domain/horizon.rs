use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Lookback window over which a price return is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    OneYear,
    SixMonth,
    ThreeMonth,
    OneMonth,
}

impl Horizon {
    /// Longest to shortest. Every per-horizon table in the crate uses this order.
    pub const ALL: [Horizon; 4] = [
        Horizon::OneYear,
        Horizon::SixMonth,
        Horizon::ThreeMonth,
        Horizon::OneMonth,
    ];

    pub fn index(self) -> usize {
        match self {
            Horizon::OneYear => 0,
            Horizon::SixMonth => 1,
            Horizon::ThreeMonth => 2,
            Horizon::OneMonth => 3,
        }
    }

    /// Column label prefix used in reports ("One-Year Price Return").
    pub fn label(self) -> &'static str {
        match self {
            Horizon::OneYear => "One-Year",
            Horizon::SixMonth => "Six-Month",
            Horizon::ThreeMonth => "Three-Month",
            Horizon::OneMonth => "One-Month",
        }
    }

    pub fn short_code(self) -> &'static str {
        match self {
            Horizon::OneYear => "1y",
            Horizon::SixMonth => "6m",
            Horizon::ThreeMonth => "3m",
            Horizon::OneMonth => "1m",
        }
    }

    pub fn default_days() -> HorizonMap<u32> {
        HorizonMap::new([365, 182, 91, 30])
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_code())
    }
}

/// One value per horizon, stored in [`Horizon::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HorizonMap<T>([T; 4]);

impl<T> HorizonMap<T> {
    pub fn new(values: [T; 4]) -> Self {
        Self(values)
    }

    pub fn from_fn(f: impl FnMut(Horizon) -> T) -> Self {
        Self(Horizon::ALL.map(f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Horizon, &T)> {
        Horizon::ALL.into_iter().zip(self.0.iter())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn map<U>(&self, mut f: impl FnMut(Horizon, &T) -> U) -> HorizonMap<U> {
        HorizonMap::from_fn(|h| f(h, &self.0[h.index()]))
    }
}

impl<T> Index<Horizon> for HorizonMap<T> {
    type Output = T;

    fn index(&self, h: Horizon) -> &T {
        &self.0[h.index()]
    }
}

impl<T> IndexMut<Horizon> for HorizonMap<T> {
    fn index_mut(&mut self, h: Horizon) -> &mut T {
        &mut self.0[h.index()]
    }
}
