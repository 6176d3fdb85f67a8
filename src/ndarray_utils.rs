use ndarray::prelude::*;
use ndarray::{Data, DataMut};
#[cfg(test)]
use ndarray::Dimension;

#[cfg(test)]
pub trait ArrayFloat {
    fn l2_distance(&self, rhs: &Self) -> f64;
}

pub trait Array1FloatMut {
    /// Normalize in place so that the elements sum to one.
    ///
    /// Panics if the sum is not positive; `label` names the array in the message.
    fn nip(&mut self, label: &'static str);

    fn normalize(self, label: &'static str) -> Self;
}

#[cfg(test)]
pub trait Array2FloatMut {
    fn nip_rows(&mut self);

    fn normalize_rows(self) -> Self;
}

#[cfg(test)]
impl<D, S> ArrayFloat for ArrayBase<S, D>
where
    D: Dimension,
    S: Data<Elem = f64>,
{
    fn l2_distance(&self, rhs: &Self) -> f64 {
        assert_eq!(self.shape(), rhs.shape());
        self.iter()
            .zip(rhs.iter())
            .map(|(&x, &y)| (y - x).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

impl<S> Array1FloatMut for ArrayBase<S, Ix1>
where
    S: DataMut + Data<Elem = f64>,
{
    fn nip(&mut self, label: &'static str) {
        let sum: f64 = self.sum();
        assert!(sum > 0.0, "Sum of {} must be positive", label);
        (*self) /= sum;
    }

    fn normalize(mut self, label: &'static str) -> Self {
        self.nip(label);
        self
    }
}

#[cfg(test)]
impl<S> Array2FloatMut for ArrayBase<S, Ix2>
where
    S: DataMut + Data<Elem = f64>,
{
    fn nip_rows(&mut self) {
        for mut row in self.genrows_mut() {
            let sum: f64 = row.sum();
            assert!(sum > 0.0);
            row /= sum;
        }
    }

    fn normalize_rows(mut self) -> Self {
        self.nip_rows();
        self
    }
}
