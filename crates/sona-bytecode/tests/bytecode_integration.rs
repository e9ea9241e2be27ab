//! End-to-end tests of the image format

use sona_bytecode::{
    CatchEntry, CodeObject, Image, Instruction, Literal, ModuleEntry, Opcode,
};

fn program_image() -> Image {
    let mut image = Image::new();

    let greeting = image.add_literal(Literal::String("hello".to_string()));
    let answer = image.add_literal(Literal::Integer(42));

    image.add_literal(Literal::Float(3.5));
    image.add_literal(Literal::Integer(i64::MIN));

    let mut helper = CodeObject::new("helper", "main.sona", 10);

    helper.arguments = 2;
    helper.required_arguments = 1;
    helper.rest_argument = true;
    helper.locals = 3;
    helper.registers = 6;
    helper.instructions = vec![
        Instruction::new(Opcode::GetLocal, vec![0, 0], 11),
        Instruction::new(Opcode::Return, vec![0], 12),
    ];

    let mut main = CodeObject::new("main", "main.sona", 1);

    main.registers = 4;
    main.instructions = vec![
        Instruction::new(Opcode::LoadLiteral, vec![0, greeting], 2),
        Instruction::new(Opcode::LoadLiteral, vec![1, answer], 3),
        Instruction::new(Opcode::SetBlock, vec![2, 0], 4),
        Instruction::new(Opcode::RunBlock, vec![3, 2, 0, 1], 4),
        Instruction::new(Opcode::Throw, vec![3], 5),
        Instruction::new(Opcode::Return, vec![3], 6),
    ];
    main.catch_table = vec![CatchEntry {
        start: 4,
        end: 5,
        jump_to: 5,
        register: 3,
    }];
    main.code_objects = vec![helper];

    image.code_objects.push(main);
    image.modules.push(ModuleEntry {
        name: "main".to_string(),
        code_index: 0,
        globals: 2,
    });
    image
}

#[test]
fn test_image_roundtrip_is_byte_identical() {
    let image = program_image();
    let bytes = image.write();
    let parsed = Image::parse(&bytes).expect("the image should parse");

    assert_eq!(parsed, image);
    assert_eq!(parsed.write(), bytes);
}

#[test]
fn test_parsed_image_preserves_structure() {
    let image = program_image();
    let parsed = Image::parse(&image.write()).expect("the image should parse");

    assert_eq!(parsed.literals.len(), 4);
    assert_eq!(parsed.modules.len(), 1);
    assert_eq!(parsed.modules[0].globals, 2);

    let main = &parsed.code_objects[0];

    assert_eq!(main.name, "main");
    assert_eq!(main.instructions.len(), 6);
    assert_eq!(main.catch_table.len(), 1);
    assert_eq!(main.code_objects.len(), 1);

    let helper = &main.code_objects[0];

    assert_eq!(helper.arguments, 2);
    assert!(helper.rest_argument);
    assert_eq!(helper.instructions[0].opcode, Opcode::GetLocal);
}

#[test]
fn test_truncated_image_is_rejected() {
    let bytes = program_image().write();

    for cut in [4, 10, 20, bytes.len() / 2] {
        assert!(Image::parse(&bytes[..cut]).is_err());
    }
}
