//! Predefined entanglement-distillation protocol tables.
//!
//! Each protocol is a precanned specification vector handed to the
//! throughput-aware allocator; the numbering reflects the order they were
//! coded in, nothing deeper. Output error rates are per-protocol
//! calibration data.

use crate::allocator::EdSpec;

/// `[3,1,3]_x * [2,1,2]_y * [2,1,2]_x * [[6,4,2]]` — output error 1e-15.
pub fn protocol_0(c_round_time_ns: u64, ll_buffer_capacity: usize) -> Vec<EdSpec> {
    let ll_buffer_capacity = ll_buffer_capacity.max(4);
    vec![
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            output_error_rate: 1e-2,
            input_count: 3,
            output_count: 1,
            dx: 3,
            dz: 1,
            ..EdSpec::default()
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            output_error_rate: 1e-4,
            input_count: 2,
            output_count: 1,
            dx: 2,
            dz: 2,
            ..EdSpec::default()
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            output_error_rate: 2e-8,
            input_count: 2,
            output_count: 1,
            dx: 2,
            dz: 1,
            ..EdSpec::default()
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: ll_buffer_capacity,
            output_error_rate: 3e-15,
            input_count: 6,
            output_count: 4,
            dx: 2,
            dz: 2,
        },
    ]
}

/// `[[17,9,4]] * [[25,18,3]]` — output error 3e-13.
pub fn protocol_1(c_round_time_ns: u64, ll_buffer_capacity: usize) -> Vec<EdSpec> {
    let ll_buffer_capacity = ll_buffer_capacity.max(18);
    vec![
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: 9,
            output_error_rate: 3e-6,
            input_count: 17,
            output_count: 9,
            dx: 4,
            dz: 4,
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: ll_buffer_capacity,
            output_error_rate: 3e-13,
            input_count: 25,
            output_count: 18,
            dx: 3,
            dz: 3,
        },
    ]
}

/// `[2,1,2]_x * [2,1,2]_y * [2,1,2]_x * [[4,2,2]]` — output error 4.5e-12.
pub fn protocol_2(c_round_time_ns: u64, ll_buffer_capacity: usize) -> Vec<EdSpec> {
    let ll_buffer_capacity = ll_buffer_capacity.max(2);
    vec![
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            output_error_rate: 8.4e-3,
            input_count: 2,
            output_count: 1,
            dx: 2,
            dz: 1,
            ..EdSpec::default()
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            output_error_rate: 1.4e-4,
            input_count: 2,
            output_count: 1,
            dx: 2,
            dz: 2,
            ..EdSpec::default()
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            output_error_rate: 1.2e-6,
            input_count: 2,
            output_count: 1,
            dx: 2,
            dz: 1,
            ..EdSpec::default()
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: ll_buffer_capacity,
            output_error_rate: 4.5e-12,
            input_count: 4,
            output_count: 2,
            dx: 2,
            dz: 2,
        },
    ]
}

/// `[[4,2,2]] * [[27,18,4]]` — output error 4.3e-10.
pub fn protocol_3(c_round_time_ns: u64, ll_buffer_capacity: usize) -> Vec<EdSpec> {
    let ll_buffer_capacity = ll_buffer_capacity.max(18);
    vec![
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: 3,
            output_error_rate: 4.9e-4,
            input_count: 4,
            output_count: 2,
            dx: 2,
            dz: 2,
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: ll_buffer_capacity,
            output_error_rate: 4.3e-10,
            input_count: 27,
            output_count: 18,
            dx: 4,
            dz: 4,
        },
    ]
}

/// `[[8,3,3]] * [[30,23,3]]` — output error 9.05e-11.
pub fn protocol_4(c_round_time_ns: u64, ll_buffer_capacity: usize) -> Vec<EdSpec> {
    let ll_buffer_capacity = ll_buffer_capacity.max(23);
    vec![
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: 3,
            output_error_rate: 3.85e-5,
            input_count: 8,
            output_count: 3,
            dx: 3,
            dz: 3,
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: ll_buffer_capacity,
            output_error_rate: 9.05e-11,
            input_count: 30,
            output_count: 23,
            dx: 3,
            dz: 3,
        },
    ]
}

/// `[[14,6,4]] * [[32,25,3]]` — output error 6.1e-13.
pub fn protocol_5(c_round_time_ns: u64, ll_buffer_capacity: usize) -> Vec<EdSpec> {
    let ll_buffer_capacity = ll_buffer_capacity.max(25);
    vec![
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: 6,
            output_error_rate: 4.4e-6,
            input_count: 14,
            output_count: 6,
            dx: 4,
            dz: 4,
        },
        EdSpec {
            syndrome_extraction_round_time_ns: c_round_time_ns,
            buffer_capacity: ll_buffer_capacity,
            output_error_rate: 6.1e-13,
            input_count: 32,
            output_count: 25,
            dx: 3,
            dz: 3,
        },
    ]
}

/// Looks a protocol up by its family name (`protocol_0` .. `protocol_5`).
pub fn by_name(name: &str, c_round_time_ns: u64, ll_buffer_capacity: usize) -> Option<Vec<EdSpec>> {
    match name {
        "protocol_0" => Some(protocol_0(c_round_time_ns, ll_buffer_capacity)),
        "protocol_1" => Some(protocol_1(c_round_time_ns, ll_buffer_capacity)),
        "protocol_2" => Some(protocol_2(c_round_time_ns, ll_buffer_capacity)),
        "protocol_3" => Some(protocol_3(c_round_time_ns, ll_buffer_capacity)),
        "protocol_4" => Some(protocol_4(c_round_time_ns, ll_buffer_capacity)),
        "protocol_5" => Some(protocol_5(c_round_time_ns, ll_buffer_capacity)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_protocols_resolve_by_name() {
        for i in 0..6 {
            let name = format!("protocol_{i}");
            let specs = by_name(&name, 1200, 4).unwrap();
            assert!(specs.len() >= 2, "{name}");
            // Error rates improve up the chain.
            for pair in specs.windows(2) {
                assert!(pair[1].output_error_rate < pair[0].output_error_rate, "{name}");
            }
        }
        assert!(by_name("protocol_6", 1200, 4).is_none());
    }

    #[test]
    fn last_level_buffer_floor_is_enforced() {
        let specs = protocol_1(1200, 1);
        assert_eq!(specs.last().unwrap().buffer_capacity, 18);
        let specs = protocol_5(1200, 100);
        assert_eq!(specs.last().unwrap().buffer_capacity, 100);
    }
}
