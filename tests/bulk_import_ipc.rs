mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

fn row_errors(result: &serde_json::Value) -> Vec<(u64, String)> {
    result["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .filter(|r| r["ok"].as_bool() == Some(false))
        .map(|r| {
            (
                r["row"].as_u64().unwrap_or(0),
                r["error"].as_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}

#[test]
fn exam_import_previews_then_applies_valid_rows() {
    let workspace = temp_dir("portald-import-exams");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "e0",
        "exams.create",
        json!({ "examName": "Mid Term", "maxMark": 50, "weight": 40 }),
    );

    let csv = "Exam Name,Max_Mark,Weight\n\
               Final,100,60\n\
               mid term,50,40\n\
               Lab,,10\n\
               Viva,0,10\n\
               Project,20,-5\n\
               Final,100,60\n";

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "import.exams",
        json!({ "csv": csv }),
    );
    assert_eq!(preview["mode"].as_str(), Some("preview"));
    assert_eq!(preview["accepted"].as_u64(), Some(1));
    assert_eq!(preview["rejected"].as_u64(), Some(5));
    assert_eq!(preview["inserted"].as_u64(), Some(0));
    let duplicate = "Duplicate exam (name, max mark, and weight) already exists.".to_string();
    assert_eq!(
        row_errors(&preview),
        vec![
            (3, duplicate.clone()),
            (4, "All fields required".to_string()),
            (5, "Max Mark must be a positive number".to_string()),
            (6, "Weight must be a non-negative number".to_string()),
            (7, duplicate),
        ]
    );
    let listed = request_ok(&mut stdin, &mut reader, "l1", "exams.list", json!({}));
    assert_eq!(listed["exams"].as_array().map(|a| a.len()), Some(1));

    let path = workspace.join("exams.csv");
    std::fs::write(&path, csv).expect("write csv");
    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "import.exams",
        json!({ "path": path.to_string_lossy(), "mode": "apply" }),
    );
    assert_eq!(applied["inserted"].as_u64(), Some(1));
    let listed = request_ok(&mut stdin, &mut reader, "l2", "exams.list", json!({}));
    assert_eq!(listed["exams"].as_array().map(|a| a.len()), Some(2));

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "bad",
        "import.exams",
        json!({ "csv": csv, "mode": "commit" }),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn mark_import_resolves_names_and_guards_weight() {
    let workspace = temp_dir("portald-import-marks");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "s1",
            "students.create",
            json!({ "studentNo": "CS_001", "name": "Ishan Fernando", "department": "CS", "dateOfBirth": "2004-04-04" }),
        ),
        "studentId",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "sub1",
        "subjects.create",
        json!({ "subjectCode": "CS 210", "subjectName": "Algorithms", "department": "CS" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "sub2",
        "subjects.create",
        json!({ "subjectName": "Thermodynamics", "department": "ME" }),
    );
    for (id, name, max, weight) in [("e1", "Mid Term", 50, 50), ("e2", "Final", 100, 50), ("e3", "Quiz", 10, 10)] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "exams.create",
            json!({ "examName": name, "maxMark": max, "weight": weight }),
        );
    }

    let csv = "student,subject,exam,marks_obtained,exam_date,semester,year\n\
               cs001,algorithms,midterm,42,05-03-2025,2,2025\n\
               cs001,CS210,final,88,45736,2,2025\n\
               cs001,algorithms,quiz,8,06/03/25,2,2025\n\
               nobody,algorithms,final,50,05-03-2025,2,2025\n\
               cs001,thermodynamics,final,50,05-03-2025,2,2025\n\
               cs001,algorithms,final,101,05-03-2025,2,2025\n\
               cs001,algorithms,midterm,,05-03-2025,2,2025\n\
               cs001,algorithms,midterm,40,2025/13/01,2,2025\n";

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "import.marks",
        json!({ "csv": csv, "mode": "apply" }),
    );
    assert_eq!(applied["inserted"].as_u64(), Some(2));
    assert_eq!(
        row_errors(&applied),
        vec![
            (
                4,
                "Adding this mark would exceed 100% total weightage for this subject.".to_string()
            ),
            (5, "Student not found".to_string()),
            (6, "Subject not found".to_string()),
            (7, "Marks cannot exceed max mark (100)".to_string()),
            (8, "Marks required".to_string()),
            (
                9,
                "Invalid or missing exam date (use DD-MM-YYYY or DD/MM/YYYY)".to_string()
            ),
        ]
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "marks.report",
        json!({ "studentId": student_id }),
    );
    let subject = &report["subjects"][0];
    assert_eq!(subject["totalWeight"].as_f64(), Some(100.0));
    assert_eq!(subject["normalizedTotal"].as_f64(), Some(86.0));
    assert_eq!(subject["grade"].as_str(), Some("A"));
    let dates: Vec<&str> = subject["components"]
        .as_array()
        .expect("components")
        .iter()
        .filter_map(|c| c["examDate"].as_str())
        .collect();
    assert!(dates.contains(&"2025-03-05"));
    assert!(dates.contains(&"2025-03-20"));

    // Re-importing the same sheet finds every valid row already recorded.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "import.marks",
        json!({ "csv": csv }),
    );
    assert_eq!(again["accepted"].as_u64(), Some(0));
}
