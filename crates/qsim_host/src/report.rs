//! Tabular stat-line reporting shared by the tools.

use std::fmt::Display;

pub fn print_stat_line<T: Display>(name: &str, value: T) {
    println!("{name:<52} : {value:>12}");
}

pub fn print_stat_line_f64(name: &str, value: f64) {
    println!("{name:<52} : {value:>12.6}");
}

pub fn print_indented_stat_line<T: Display>(name: &str, value: T) {
    let name = format!("\t{name}");
    println!("{name:<52} : {value:>12}");
}
