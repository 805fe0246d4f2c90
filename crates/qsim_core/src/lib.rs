#![feature(generic_const_exprs)]
#![allow(incomplete_features)]

pub mod bigint;
pub mod dag;
pub mod fixed_point;
pub mod instruction;
pub mod manager;
pub mod synthesis;
