use discon_proto::{
    cstr_str, generate_server_path, validate_server_path, Frame, SWAP_INFILE_LEN, SWAP_MSG_LEN,
    SWAP_OUTNAME_LEN, SWAP_SWAP_LEN,
};

/// The shape of a first ABI call as a host simulator produces it.
fn first_call_frame() -> Frame {
    let mut frame = Frame {
        swap: vec![0.0; 130],
        fail: 1,
        in_file: b"input.txt\0".to_vec(),
        out_name: b"output.txt\0".to_vec(),
        msg: vec![0u8; 21],
        file_content: Vec::new(),
        server_file_path: Vec::new(),
    };
    frame.swap[SWAP_MSG_LEN] = 21.0;
    frame.swap[SWAP_INFILE_LEN] = 10.0;
    frame.swap[SWAP_OUTNAME_LEN] = 11.0;
    frame.swap[SWAP_SWAP_LEN] = 130.0;
    frame
}

#[test]
fn abi_call_round_trip_preserves_lengths() {
    let frame = first_call_frame();
    let decoded = Frame::decode(&frame.encode()).expect("decode");

    assert_eq!(decoded, frame);
    assert_eq!(decoded.swap.len(), 130);
    assert_eq!(decoded.swap[SWAP_SWAP_LEN] as usize, decoded.swap.len());
    assert_eq!(decoded.swap[SWAP_INFILE_LEN] as usize, decoded.in_file.len());
    assert_eq!(decoded.swap[SWAP_OUTNAME_LEN] as usize, decoded.out_name.len());
    assert_eq!(decoded.swap[SWAP_MSG_LEN] as usize, decoded.msg.len());
    assert_eq!(cstr_str(&decoded.in_file), "input.txt");
    assert_eq!(cstr_str(&decoded.out_name), "output.txt");
    assert!(!decoded.is_file_transfer());
}

#[test]
fn staging_exchange_round_trip() {
    let content = b"pitch gains table".to_vec();
    let server_path = generate_server_path(&content, "conf/gains.dat");
    validate_server_path(&server_path).expect("generated paths are always valid");

    let request = Frame::file_transfer(content.clone(), &server_path);
    let decoded = Frame::decode(&request.encode()).expect("decode");
    assert!(decoded.is_file_transfer());
    assert_eq!(decoded.file_content, content);
    assert_eq!(cstr_str(&decoded.server_file_path), server_path);

    // Same content and name always map to the same server path.
    assert_eq!(server_path, generate_server_path(&content, "gains.dat"));
}

#[test]
fn response_frame_survives_the_wire() {
    let response = Frame::transfer_response(false, "Security error: filename must not contain path separators");
    let decoded = Frame::decode(&response.encode()).expect("decode");
    assert_eq!(decoded.fail, 1);
    assert!(cstr_str(&decoded.msg).starts_with("Security error:"));
    assert_eq!(decoded, response);
}
