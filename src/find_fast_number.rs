use std::cmp::min;

/// Smallest number of the form `single_factor * multi_factor1^a * multi_factor2^b` that is not below `lower_limit`.
fn fast_fft_len(lower_limit: usize, single_factor: usize, multi_factor1: usize, multi_factor2: usize) -> usize {
    let mut product = single_factor;
    while product < lower_limit {
        product *= multi_factor2
    }
    let mut min = product;
    loop {
        if product > lower_limit {
            if product % multi_factor2 != 0 {
                return min
            }
            product /= multi_factor2;
        } else if product < lower_limit {
            product *= multi_factor1;
        } else {
            return product
        }
        if product > lower_limit && product < min {
            min = product;
        }
    }
}

/// Returns the smallest even length, not below the lower limit, whose only prime factors are 2, 3 and 5.
///
/// Every FFT dimension in the crate goes through this so that quadrant swaps stay exact.
pub fn composite_even_len(lower_limit: usize) -> usize {
    let lower_limit = lower_limit.max(2);
    let mut best = usize::MAX;
    let mut single = 2;
    loop {
        best = min(best, fast_fft_len(lower_limit, single, 2, 3));
        if single >= lower_limit {
            return best;
        }
        single *= 5;
    }
}
