// SPDX-License-Identifier: BSD-3-Clause
pub mod distance;
pub mod loops;
pub mod points_to;
